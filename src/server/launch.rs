//! Launch command line for the screen session, derived from `server.config`.

use std::path::Path;

use crate::config::IniDocument;
use crate::server::error::{ServerError, ServerResult};
use crate::utils::{parse_bool, parse_leading_int, resolve_binary};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeKind {
    /// Vanilla-style jar; heap bounds are mandatory.
    Jar,
    /// `minecraft.unconventional`: heap bounds optional.
    UnconventionalJar,
    Phar,
    /// Anything else is run as `./<jarfile>` (e.g. Cuberite).
    Native,
}

impl RuntimeKind {
    pub fn detect(jarfile: &str, unconventional: bool) -> Self {
        let lower = jarfile.to_ascii_lowercase();
        if lower.ends_with(".jar") {
            if unconventional {
                RuntimeKind::UnconventionalJar
            } else {
                RuntimeKind::Jar
            }
        } else if lower.ends_with(".phar") {
            RuntimeKind::Phar
        } else {
            RuntimeKind::Native
        }
    }
}

/// Program and arguments run inside `screen -dmS mc-<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub kind: RuntimeKind,
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchPlan {
    /// The full argv handed to `screen`.
    pub fn screen_args(&self, session: &str) -> Vec<String> {
        let mut argv = vec!["-dmS".to_string(), session.to_string(), self.program.clone()];
        argv.extend(self.args.iter().cloned());
        argv
    }
}

fn java_value<'a>(sc: &'a IniDocument, key: &str) -> Option<&'a str> {
    sc.get("java", key).filter(|v| !v.trim().is_empty())
}

fn java_binary(sc: &IniDocument) -> ServerResult<String> {
    match java_value(sc, "java_binary") {
        Some(binary) => Ok(binary.to_string()),
        None => resolve_binary("java")
            .map(|p| p.display().to_string())
            .map_err(|_| ServerError::InvalidArgument("No java binary assigned for server.".into())),
    }
}

fn is_forge_installer(jarfile: &str) -> bool {
    let lower = jarfile.to_ascii_lowercase();
    lower.starts_with("forge") && lower.ends_with("installer.jar")
}

/// Build the launch plan for an instance whose cwd is `cwd`.
pub fn start_args(sc: &IniDocument, cwd: &Path) -> ServerResult<LaunchPlan> {
    let Some(jarfile) = java_value(sc, "jarfile") else {
        return Err(ServerError::InvalidArgument(
            "Cannot start server without a designated jar/phar.".into(),
        ));
    };
    let unconventional = parse_bool(sc.get("minecraft", "unconventional"));
    let kind = RuntimeKind::detect(jarfile, unconventional);

    let xmx = parse_leading_int(sc.get("java", "java_xmx")).unwrap_or(0);
    let xms_raw = parse_leading_int(sc.get("java", "java_xms")).filter(|v| *v != 0);
    let tweaks: Vec<String> = java_value(sc, "java_tweaks")
        .map(|t| t.split_whitespace().map(String::from).collect())
        .unwrap_or_default();

    match kind {
        RuntimeKind::Jar => {
            if xmx <= 0 {
                return Err(ServerError::InvalidArgument("XMX heapsize must be positive integer > 0".into()));
            }
            let xms = xms_raw.unwrap_or(xmx);
            if !(xmx >= xms && xms > 0) {
                return Err(ServerError::InvalidArgument(
                    "XMS heapsize must be positive integer where XMX >= XMS > 0".into(),
                ));
            }
            let mut args = vec!["-server".to_string(), format!("-Xmx{}M", xmx), format!("-Xms{}M", xms)];
            args.extend(tweaks);
            args.push("-jar".into());
            args.push(jarfile.to_string());
            let jar_args = java_value(sc, "jar_args").unwrap_or("nogui");
            args.extend(jar_args.split_whitespace().map(String::from));
            if is_forge_installer(jarfile) {
                args.push("--installServer".into());
            }
            Ok(LaunchPlan { kind, program: java_binary(sc)?, args })
        }
        RuntimeKind::UnconventionalJar => {
            if xmx < 0 {
                return Err(ServerError::InvalidArgument("XMX heapsize must be positive integer >= 0".into()));
            }
            let xms = xms_raw.unwrap_or(0);
            if !(xmx >= xms && xms >= 0) {
                return Err(ServerError::InvalidArgument(
                    "XMS heapsize must be positive integer where XMX >= XMS >= 0".into(),
                ));
            }
            let mut args = vec!["-server".to_string()];
            if xmx > 0 {
                args.push(format!("-Xmx{}M", xmx));
            }
            if xms > 0 {
                args.push(format!("-Xms{}M", xms));
            }
            args.extend(tweaks);
            args.push("-jar".into());
            args.push(jarfile.to_string());
            if let Some(jar_args) = java_value(sc, "jar_args") {
                args.extend(jar_args.split_whitespace().map(String::from));
            }
            Ok(LaunchPlan { kind, program: java_binary(sc)?, args })
        }
        RuntimeKind::Phar => {
            let program = if cwd.join("bin/php7/bin/php").exists() {
                "./bin/php7/bin/php"
            } else {
                "./bin/php5/bin/php"
            };
            Ok(LaunchPlan {
                kind,
                program: program.to_string(),
                args: vec![jarfile.to_string()],
            })
        }
        RuntimeKind::Native => Ok(LaunchPlan {
            kind,
            program: format!("./{}", jarfile.trim_start_matches("./")),
            args: Vec::new(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sc(pairs: &[(&str, &str, &str)]) -> IniDocument {
        let mut doc = IniDocument::new();
        doc.set("java", "java_binary", "/usr/bin/java");
        for (section, key, value) in pairs {
            doc.set(section, key, *value);
        }
        doc
    }

    fn cwd() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn conventional_jar() {
        let dir = cwd();
        let plan = start_args(
            &sc(&[("java", "jarfile", "minecraft_server.1.20.jar"), ("java", "java_xmx", "1024")]),
            dir.path(),
        )
        .unwrap();
        assert_eq!(plan.kind, RuntimeKind::Jar);
        assert_eq!(plan.program, "/usr/bin/java");
        assert_eq!(
            plan.args,
            vec!["-server", "-Xmx1024M", "-Xms1024M", "-jar", "minecraft_server.1.20.jar", "nogui"]
        );
        assert_eq!(&plan.screen_args("mc-alpha")[..3], ["-dmS", "mc-alpha", "/usr/bin/java"]);
    }

    #[test]
    fn conventional_jar_requires_heap() {
        let dir = cwd();
        let err = start_args(&sc(&[("java", "jarfile", "server.jar")]), dir.path()).unwrap_err();
        assert!(err.to_string().contains("XMX"));

        let err = start_args(
            &sc(&[("java", "jarfile", "server.jar"), ("java", "java_xmx", "256"), ("java", "java_xms", "512")]),
            dir.path(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("XMS"));
    }

    #[test]
    fn tweaks_and_forge_installer() {
        let dir = cwd();
        let plan = start_args(
            &sc(&[
                ("java", "jarfile", "forge-1.12.2-installer.jar"),
                ("java", "java_xmx", "2048"),
                ("java", "java_xms", "512"),
                ("java", "java_tweaks", "-XX:+UseG1GC  -Dfoo=bar"),
                ("java", "jar_args", "--port 25570"),
            ]),
            dir.path(),
        )
        .unwrap();
        assert_eq!(
            plan.args,
            vec![
                "-server",
                "-Xmx2048M",
                "-Xms512M",
                "-XX:+UseG1GC",
                "-Dfoo=bar",
                "-jar",
                "forge-1.12.2-installer.jar",
                "--port",
                "25570",
                "--installServer"
            ]
        );
    }

    #[test]
    fn unconventional_jar_omits_unset_heap() {
        let dir = cwd();
        let plan = start_args(
            &sc(&[("java", "jarfile", "BungeeCord.jar"), ("minecraft", "unconventional", "true")]),
            dir.path(),
        )
        .unwrap();
        assert_eq!(plan.kind, RuntimeKind::UnconventionalJar);
        assert_eq!(plan.args, vec!["-server", "-jar", "BungeeCord.jar"]);
    }

    #[test]
    fn phar_prefers_php7() {
        let dir = cwd();
        let doc = sc(&[("java", "jarfile", "PocketMine-MP.phar")]);
        assert_eq!(start_args(&doc, dir.path()).unwrap().program, "./bin/php5/bin/php");

        std::fs::create_dir_all(dir.path().join("bin/php7/bin")).unwrap();
        std::fs::write(dir.path().join("bin/php7/bin/php"), "").unwrap();
        let plan = start_args(&doc, dir.path()).unwrap();
        assert_eq!(plan.program, "./bin/php7/bin/php");
        assert_eq!(plan.args, vec!["PocketMine-MP.phar"]);
    }

    #[test]
    fn native_binary_and_missing_jarfile() {
        let dir = cwd();
        let plan = start_args(&sc(&[("java", "jarfile", "Cuberite")]), dir.path()).unwrap();
        assert_eq!(plan.kind, RuntimeKind::Native);
        assert_eq!(plan.program, "./Cuberite");

        let err = start_args(&sc(&[]), dir.path()).unwrap_err();
        assert_eq!(err.to_string(), "Cannot start server without a designated jar/phar.");
    }
}
