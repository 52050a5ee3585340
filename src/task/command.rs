//! Command templates.
//!
//! A template is parsed once when the kind is declared and rendered once per
//! execution. Supported references:
//!
//! - `${VAR}` expands to the flattened environment value of `VAR`,
//! - `${SRC}` / `${TGT}` expand to all inputs / outputs, space separated,
//! - `${SRC[i]}` / `${TGT[i]}` select a single node,
//! - `.abspath`, `.parent` and `.name` may follow a node reference,
//! - `$$` is a literal dollar sign.

use std::process::Command;
use std::str::FromStr;

use camino::Utf8Path;

use crate::core::Node;
use crate::env::Environment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Src,
    Tgt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeAttr {
    Abspath,
    Parent,
    Name,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Text(String),
    Var(String),
    Nodes {
        side: Side,
        index: Option<usize>,
        attr: NodeAttr,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    source: String,
    parts: Vec<Part>,
}

impl FromStr for CommandTemplate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = Vec::new();
        let mut text = String::new();
        let mut rest = s;

        while let Some(at) = rest.find('$') {
            text.push_str(&rest[..at]);
            rest = &rest[at + 1..];

            if let Some(tail) = rest.strip_prefix('$') {
                text.push('$');
                rest = tail;
                continue;
            }

            let Some(tail) = rest.strip_prefix('{') else {
                text.push('$');
                continue;
            };

            let end = tail
                .find('}')
                .ok_or_else(|| format!("unterminated reference in '{s}'"))?;

            if !text.is_empty() {
                parts.push(Part::Text(std::mem::take(&mut text)));
            }
            parts.push(parse_reference(&tail[..end])?);
            rest = &tail[end + 1..];
        }

        text.push_str(rest);
        if !text.is_empty() {
            parts.push(Part::Text(text));
        }

        Ok(Self {
            source: s.to_string(),
            parts,
        })
    }
}

fn parse_reference(inner: &str) -> Result<Part, String> {
    let (head, attr) = match inner.split_once('.') {
        Some((head, attr)) => (head, Some(attr)),
        None => (inner, None),
    };

    let (name, index) = match head.split_once('[') {
        Some((name, index)) => {
            let index = index
                .strip_suffix(']')
                .and_then(|i| i.parse::<usize>().ok())
                .ok_or_else(|| format!("bad index in '${{{inner}}}'"))?;
            (name, Some(index))
        }
        None => (head, None),
    };

    let side = match name {
        "SRC" => Side::Src,
        "TGT" => Side::Tgt,
        var => {
            let valid = !var.is_empty()
                && var.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid || index.is_some() || attr.is_some() {
                return Err(format!("bad variable reference '${{{inner}}}'"));
            }
            return Ok(Part::Var(var.to_string()));
        }
    };

    let attr = match attr {
        None | Some("abspath") => NodeAttr::Abspath,
        Some("parent") => NodeAttr::Parent,
        Some("name") => NodeAttr::Name,
        Some(other) => return Err(format!("unknown node attribute '{other}'")),
    };

    Ok(Part::Nodes { side, index, attr })
}

impl CommandTemplate {
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Environment variables referenced by the template, in order of first use.
    pub fn vars(&self) -> Vec<String> {
        let mut vars: Vec<String> = Vec::new();
        for part in &self.parts {
            if let Part::Var(name) = part
                && !vars.contains(name)
            {
                vars.push(name.clone());
            }
        }
        vars
    }

    pub fn render(
        &self,
        env: &Environment,
        inputs: &[Node],
        outputs: &[Node],
    ) -> Result<String, String> {
        let mut out = String::new();

        for part in &self.parts {
            match part {
                Part::Text(text) => out.push_str(text),
                Part::Var(name) => out.push_str(&env.get_flat(name)),
                Part::Nodes { side, index, attr } => {
                    let (nodes, label) = match side {
                        Side::Src => (inputs, "SRC"),
                        Side::Tgt => (outputs, "TGT"),
                    };
                    let selected = match index {
                        Some(i) => std::slice::from_ref(nodes.get(*i).ok_or_else(|| {
                            format!("{label}[{i}] is out of range ({} nodes)", nodes.len())
                        })?),
                        None => nodes,
                    };
                    let rendered: Vec<&str> = selected
                        .iter()
                        .map(|node| match attr {
                            NodeAttr::Abspath => node.path().as_str(),
                            NodeAttr::Parent => node.parent().as_str(),
                            NodeAttr::Name => node.name(),
                        })
                        .collect();
                    out.push_str(&rendered.join(" "));
                }
            }
        }

        Ok(out)
    }
}

/// Output of one external command.
#[derive(Debug)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a rendered command line through the platform shell.
pub fn execute(line: &str, cwd: Option<&Utf8Path>) -> std::io::Result<CommandOutput> {
    let mut command = if cfg!(windows) {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(line);
        command
    } else {
        let mut command = Command::new("sh");
        command.arg("-c").arg(line);
        command
    };

    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    let output = command.output()?;
    Ok(CommandOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(paths: &[&str]) -> Vec<Node> {
        paths.iter().map(Node::source).collect()
    }

    #[test]
    fn test_render() {
        let template: CommandTemplate = "${CC} ${CFLAGS} -c ${SRC} -o ${TGT[0]}".parse().unwrap();
        let mut env = Environment::new();
        env.set("CC", "gcc").set("CFLAGS", ["-O2", "-Wall"]);

        let line = template
            .render(&env, &nodes(&["/s/a.c", "/s/b.c"]), &nodes(&["/b/a.o"]))
            .unwrap();
        assert_eq!(line, "gcc -O2 -Wall -c /s/a.c /s/b.c -o /b/a.o");
        assert_eq!(template.vars(), vec!["CC", "CFLAGS"]);
    }

    #[test]
    fn test_node_attributes_and_escapes() {
        let template: CommandTemplate = "cd ${TGT[0].parent} && echo $$HOME ${SRC[0].name}"
            .parse()
            .unwrap();
        let line = template
            .render(&Environment::new(), &nodes(&["/s/a.c"]), &nodes(&["/b/x/a.o"]))
            .unwrap();
        assert_eq!(line, "cd /b/x && echo $HOME a.c");
    }

    #[test]
    fn test_parse_errors() {
        assert!("${CC".parse::<CommandTemplate>().is_err());
        assert!("${SRC[x]}".parse::<CommandTemplate>().is_err());
        assert!("${SRC.stem}".parse::<CommandTemplate>().is_err());
        assert!("${CC[0]}".parse::<CommandTemplate>().is_err());
    }

    #[test]
    fn test_index_out_of_range() {
        let template: CommandTemplate = "cp ${SRC[1]} ${TGT}".parse().unwrap();
        let err = template
            .render(&Environment::new(), &nodes(&["/a"]), &nodes(&["/b"]))
            .unwrap_err();
        assert!(err.contains("SRC[1]"));
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_exit_code() {
        let ok = execute("echo hi", None).unwrap();
        assert_eq!(ok.code, 0);
        assert_eq!(ok.stdout.trim(), "hi");
        assert_eq!(execute("exit 3", None).unwrap().code, 3);
    }
}
