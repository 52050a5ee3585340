//! Ready-made kinds for C and C++ projects.
//!
//! Both read the usual toolchain variables from the task environment:
//! `CC`, `CFLAGS`, `CPPFLAGS` and `INCFLAGS` for compilation, `LINK_CC`,
//! `LINKFLAGS` and `LIBS` for linking. [`include_flags`] turns the
//! `INCPATHS` list, which the scanner also reads, into `INCFLAGS`.

use std::sync::Arc;

use console::Color;

use crate::env::Environment;
use crate::error::ConfigError;
use crate::scan::CScanner;
use crate::task::{Registry, TaskKind};

pub const COMPILE: &str = "cc";
pub const LINK: &str = "link";

/// Registers the `.c`/`.cxx` to `.o` kind with the preprocessor scanner.
pub fn c_compile(registry: &mut Registry) -> Result<Arc<TaskKind>, ConfigError> {
    let kind = TaskKind::command(
        COMPILE,
        "${CC} ${CFLAGS} ${CPPFLAGS} ${INCFLAGS} -c ${SRC[0].abspath} -o ${TGT[0].abspath}",
    )?
    .ext_in([".c", ".cxx"])
    .ext_out([".o"])
    .vars([
        "CC", "CFLAGS", "CPPFLAGS", "INCFLAGS", "INCPATHS", "DEFINES", "DEFLINES",
    ])
    .scanner(CScanner::new())
    .build();
    registry.register(kind)
}

/// Registers the object-file linker. Links run one at a time.
pub fn link(registry: &mut Registry) -> Result<Arc<TaskKind>, ConfigError> {
    let kind = TaskKind::command(
        LINK,
        "${LINK_CC} ${SRC.abspath} -o ${TGT[0].abspath} ${LINKFLAGS} ${LIBS}",
    )?
    .ext_in([".o"])
    .maxjobs(1)
    .color(Color::Yellow)
    .build();
    registry.register(kind)
}

/// Sets `INCFLAGS` to one `-I` flag per entry of `INCPATHS`.
pub fn include_flags(env: &mut Environment) {
    let flags: Vec<String> = env
        .get_list("INCPATHS")
        .into_iter()
        .map(|path| format!("-I{path}"))
        .collect();
    env.set("INCFLAGS", flags);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{AttrKey, AttrValue, RunBehavior};

    #[test]
    fn test_registered_kinds() {
        let mut registry = Registry::new();
        let cc = c_compile(&mut registry).unwrap();
        let ld = link(&mut registry).unwrap();

        assert!(registry.contains("cc") && registry.contains("link"));
        assert!(cc.scanner().is_some());
        assert!(ld.scanner().is_none());
        assert_eq!(
            cc.defaults.get(&AttrKey::ExtOut),
            Some(&AttrValue::list([".o"]))
        );
        assert_eq!(ld.defaults.get(&AttrKey::MaxJobs), Some(&AttrValue::Count(1)));
        let AttrValue::List(vars) = &cc.defaults[&AttrKey::Vars] else {
            panic!("vars are a list");
        };
        assert!(vars.iter().any(|v| &**v == "INCPATHS"));
        assert!(matches!(ld.run(), RunBehavior::Command(_)));

        // Link declares no vars, so it depends on the ones it references.
        assert_eq!(
            ld.defaults.get(&AttrKey::Vars),
            Some(&AttrValue::list(["LINK_CC", "LINKFLAGS", "LIBS"]))
        );

        assert!(matches!(
            c_compile(&mut registry),
            Err(ConfigError::DuplicateKind(_))
        ));
    }

    #[test]
    fn test_include_flags() {
        let mut env = Environment::new();
        env.set("INCPATHS", vec!["include", "/usr/local/include"]);
        include_flags(&mut env);
        assert_eq!(env.get_flat("INCFLAGS"), "-Iinclude -I/usr/local/include");
    }
}
