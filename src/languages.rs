//! Language registry for the twelve supported languages.
//!
//! Each entry describes how a language's source is staged and executed:
//! the interactive language runs through the pre-warmed interpreter server,
//! interpreted languages invoke a runner on the staged source file, and
//! compiled languages go through separate compile and run invocations of
//! the isolation driver.
//!
//! Command templates use `{source}` for the staged source path and `{bin}`
//! for the build output path, both inside the sandbox mount.

use serde::{Deserialize, Serialize};

/// Mount point of the sandbox scratch directory inside the sandbox.
pub const DATA_MOUNT: &str = "/mnt/data";

/// Directory inside the scratch mount where build artifacts land.
/// Hidden so the output-file scan does not pick artifacts up.
pub const BUILD_DIR: &str = "/mnt/data/.codebox";

/// Supported language tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "py")]
    Python,
    #[serde(rename = "js")]
    JavaScript,
    #[serde(rename = "ts")]
    TypeScript,
    #[serde(rename = "go")]
    Go,
    #[serde(rename = "java")]
    Java,
    #[serde(rename = "c")]
    C,
    #[serde(rename = "cpp")]
    Cpp,
    #[serde(rename = "php")]
    Php,
    #[serde(rename = "rs")]
    Rust,
    #[serde(rename = "r")]
    R,
    #[serde(rename = "f90")]
    Fortran,
    #[serde(rename = "d")]
    D,
}

impl Language {
    /// All supported languages.
    pub const ALL: [Language; 12] = [
        Language::Python,
        Language::JavaScript,
        Language::TypeScript,
        Language::Go,
        Language::Java,
        Language::C,
        Language::Cpp,
        Language::Php,
        Language::Rust,
        Language::R,
        Language::Fortran,
        Language::D,
    ];

    /// Parses a language tag such as `"py"` or `"cpp"`.
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        let tag = tag.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|lang| lang.as_tag() == tag)
    }

    /// Returns the short language tag.
    #[must_use]
    pub fn as_tag(&self) -> &'static str {
        self.config().tag
    }

    /// True for the interactive language served by the pre-warmed pool.
    #[must_use]
    pub fn is_interactive(&self) -> bool {
        matches!(self.config().kind, LanguageKind::Interactive)
    }

    /// Returns the static execution configuration for this language.
    #[must_use]
    pub fn config(&self) -> &'static LanguageConfig {
        &LANGUAGES[*self as usize]
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// How a language's code reaches execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageKind {
    /// Served by the long-lived interpreter server over the frame protocol.
    Interactive,
    /// A direct runner is invoked on the staged source file.
    Interpreted {
        runner: &'static [&'static str],
    },
    /// A compile invocation produces an artifact which a second invocation runs.
    Compiled {
        compile: &'static [&'static str],
        run: &'static [&'static str],
    },
}

/// Static execution configuration for one language.
#[derive(Debug)]
pub struct LanguageConfig {
    pub tag: &'static str,
    pub display_name: &'static str,
    /// Name the staged source file gets inside the scratch directory.
    pub source_file: &'static str,
    pub kind: LanguageKind,
    /// Sandbox uid/gid the child runs as.
    pub uid: u32,
    /// Environment whitelist applied on top of the common set.
    pub env: &'static [(&'static str, &'static str)],
    /// Host paths bind-mounted read-only for the language runtime.
    pub bind_paths: &'static [&'static str],
    /// Multiplier applied to the base wall-clock budget.
    pub timeout_multiplier: f64,
}

static LANGUAGES: [LanguageConfig; 12] = [
    LanguageConfig {
        tag: "py",
        display_name: "Python",
        source_file: "main.py",
        kind: LanguageKind::Interactive,
        uid: 1001,
        env: &[
            ("PYTHONUNBUFFERED", "1"),
            ("PYTHONDONTWRITEBYTECODE", "1"),
            ("PYTHONPATH", "/mnt/data"),
            ("MPLCONFIGDIR", "/tmp/mplconfig"),
            ("XDG_CACHE_HOME", "/tmp/.cache"),
            ("MPLBACKEND", "Agg"),
        ],
        bind_paths: &[
            "/usr/local/lib/python3",
            "/usr/local/bin/python3",
            "/usr/local/bin/python",
        ],
        timeout_multiplier: 1.0,
    },
    LanguageConfig {
        tag: "js",
        display_name: "JavaScript",
        source_file: "main.js",
        kind: LanguageKind::Interpreted {
            runner: &["node", "{source}"],
        },
        uid: 1002,
        env: &[("NODE_PATH", "/usr/local/lib/node_modules")],
        bind_paths: &["/usr/local/bin/node", "/usr/local/lib/node_modules"],
        timeout_multiplier: 1.0,
    },
    LanguageConfig {
        tag: "ts",
        display_name: "TypeScript",
        source_file: "main.ts",
        kind: LanguageKind::Compiled {
            compile: &[
                "tsc",
                "{source}",
                "--outDir",
                BUILD_DIR,
                "--module",
                "commonjs",
                "--target",
                "ES2019",
            ],
            run: &["node", "/mnt/data/.codebox/main.js"],
        },
        uid: 1003,
        env: &[("NODE_PATH", "/usr/local/lib/node_modules")],
        bind_paths: &[
            "/usr/local/bin/node",
            "/usr/local/bin/tsc",
            "/usr/local/lib/node_modules",
        ],
        timeout_multiplier: 1.2,
    },
    LanguageConfig {
        tag: "go",
        display_name: "Go",
        source_file: "main.go",
        kind: LanguageKind::Compiled {
            compile: &["go", "build", "-o", "{bin}", "{source}"],
            run: &["{bin}"],
        },
        uid: 1004,
        env: &[
            ("GO111MODULE", "off"),
            ("GOCACHE", "/tmp/go-build"),
            ("PATH", "/usr/local/go/bin:/usr/local/bin:/usr/bin:/bin"),
        ],
        bind_paths: &["/usr/local/go"],
        timeout_multiplier: 1.5,
    },
    LanguageConfig {
        tag: "java",
        display_name: "Java",
        source_file: "Main.java",
        kind: LanguageKind::Compiled {
            compile: &["javac", "-d", BUILD_DIR, "{source}"],
            run: &["java", "-cp", BUILD_DIR, "Main"],
        },
        uid: 1005,
        env: &[
            ("JAVA_OPTS", "-Xmx512m -Xms128m"),
            ("PATH", "/opt/java/openjdk/bin:/usr/local/bin:/usr/bin:/bin"),
        ],
        bind_paths: &["/opt/java", "/usr/lib/jvm"],
        timeout_multiplier: 2.0,
    },
    LanguageConfig {
        tag: "c",
        display_name: "C",
        source_file: "main.c",
        kind: LanguageKind::Compiled {
            compile: &["gcc", "-o", "{bin}", "{source}"],
            run: &["{bin}"],
        },
        uid: 1006,
        env: &[("CC", "gcc")],
        bind_paths: &[],
        timeout_multiplier: 1.5,
    },
    LanguageConfig {
        tag: "cpp",
        display_name: "C++",
        source_file: "main.cpp",
        kind: LanguageKind::Compiled {
            compile: &["g++", "-o", "{bin}", "{source}"],
            run: &["{bin}"],
        },
        uid: 1007,
        env: &[("CXX", "g++")],
        bind_paths: &[],
        timeout_multiplier: 1.5,
    },
    LanguageConfig {
        tag: "php",
        display_name: "PHP",
        source_file: "main.php",
        kind: LanguageKind::Interpreted {
            runner: &["php", "{source}"],
        },
        uid: 1008,
        env: &[("PHP_INI_SCAN_DIR", "/usr/local/etc/php/conf.d")],
        bind_paths: &[
            "/usr/local/etc/php",
            "/usr/local/bin/php",
            "/usr/local/lib/php",
        ],
        timeout_multiplier: 1.0,
    },
    LanguageConfig {
        tag: "rs",
        display_name: "Rust",
        source_file: "main.rs",
        kind: LanguageKind::Compiled {
            compile: &["rustc", "{source}", "-o", "{bin}"],
            run: &["{bin}"],
        },
        uid: 1009,
        env: &[
            ("CARGO_HOME", "/usr/local/cargo"),
            ("RUSTUP_HOME", "/usr/local/rustup"),
            (
                "PATH",
                "/usr/local/cargo/bin:/usr/local/rustup/toolchains/stable-x86_64-unknown-linux-gnu/bin:/usr/local/bin:/usr/bin:/bin",
            ),
        ],
        bind_paths: &["/usr/local/cargo", "/usr/local/rustup"],
        timeout_multiplier: 3.0,
    },
    LanguageConfig {
        tag: "r",
        display_name: "R",
        source_file: "main.r",
        kind: LanguageKind::Interpreted {
            runner: &["Rscript", "{source}"],
        },
        uid: 1010,
        env: &[("R_LIBS_USER", "/usr/local/lib/R/site-library")],
        bind_paths: &["/usr/local/lib/R", "/usr/lib/R"],
        timeout_multiplier: 1.5,
    },
    LanguageConfig {
        tag: "f90",
        display_name: "Fortran",
        source_file: "main.f90",
        kind: LanguageKind::Compiled {
            compile: &["gfortran", "-o", "{bin}", "{source}"],
            run: &["{bin}"],
        },
        uid: 1011,
        env: &[("FC", "gfortran")],
        bind_paths: &[],
        timeout_multiplier: 2.0,
    },
    LanguageConfig {
        tag: "d",
        display_name: "D",
        source_file: "main.d",
        kind: LanguageKind::Compiled {
            compile: &["ldc2", "{source}", "-of={bin}"],
            run: &["{bin}"],
        },
        uid: 1012,
        env: &[],
        bind_paths: &["/usr/lib/ldc", "/usr/bin/ldc2", "/usr/bin/ldmd2"],
        timeout_multiplier: 2.0,
    },
];

/// Expands `{source}` and `{bin}` placeholders in a command template.
#[must_use]
pub fn expand_template(template: &[&str], source: &str, bin: &str) -> Vec<String> {
    template
        .iter()
        .map(|part| part.replace("{source}", source).replace("{bin}", bin))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_tags_round_trip() {
        for lang in Language::ALL {
            assert_eq!(Language::from_tag(lang.as_tag()), Some(lang));
        }
        assert_eq!(Language::ALL.len(), 12);
    }

    #[test]
    fn test_from_tag_normalizes() {
        assert_eq!(Language::from_tag(" PY "), Some(Language::Python));
        assert_eq!(Language::from_tag("CPP"), Some(Language::Cpp));
        assert_eq!(Language::from_tag("pascal"), None);
    }

    #[test]
    fn test_only_python_is_interactive() {
        for lang in Language::ALL {
            assert_eq!(lang.is_interactive(), lang == Language::Python);
        }
    }

    #[test]
    fn test_serde_tags() {
        let lang: Language = serde_json::from_str("\"f90\"").unwrap();
        assert_eq!(lang, Language::Fortran);
        assert_eq!(serde_json::to_string(&Language::Cpp).unwrap(), "\"cpp\"");
    }

    #[test]
    fn test_compiled_templates_expand() {
        let LanguageKind::Compiled { compile, run } = Language::C.config().kind else {
            panic!("C should be compiled");
        };
        let compile = expand_template(compile, "/mnt/data/main.c", "/mnt/data/.codebox/main");
        assert_eq!(compile, ["gcc", "-o", "/mnt/data/.codebox/main", "/mnt/data/main.c"]);
        let run = expand_template(run, "/mnt/data/main.c", "/mnt/data/.codebox/main");
        assert_eq!(run, ["/mnt/data/.codebox/main"]);
    }

    #[test]
    fn test_java_entrypoint_matches_source_name() {
        let config = Language::Java.config();
        assert_eq!(config.source_file, "Main.java");
        let LanguageKind::Compiled { run, .. } = config.kind else {
            panic!("Java should be compiled");
        };
        assert!(run.contains(&"Main"));
    }
}
