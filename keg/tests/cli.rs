// Runs the `keg` binary against a throwaway prefix and file:// artifacts.
#![cfg(unix)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

struct Sandbox {
    dir: tempfile::TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let sandbox = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        fs::create_dir_all(sandbox.formula_dir()).unwrap();
        fs::create_dir_all(sandbox.artifact_dir()).unwrap();
        sandbox
    }

    fn prefix(&self) -> PathBuf {
        self.dir.path().join("prefix")
    }

    fn formula_dir(&self) -> PathBuf {
        self.dir.path().join("formulae")
    }

    fn artifact_dir(&self) -> PathBuf {
        self.dir.path().join("artifacts")
    }

    fn keg(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_keg"))
            .args(args)
            .env("KEG_PREFIX", self.prefix())
            .env("KEG_FORMULA_PATH", self.formula_dir())
            .env("KEG_PLATFORM_TAG", "keg_test")
            .env_remove("KEG_LOG")
            .env_remove("KEG_BUILD_FROM_SOURCE")
            .env_remove("KEG_CONTINUE_ON_FAILURE")
            .output()
            .unwrap()
    }

    /// Writes a source formula whose tarball ships `configure`.
    fn add_source_formula(&self, name: &str, deps: &[&str], configure: &str) {
        let archive = self.artifact_dir().join(format!("{name}-1.0.tar.gz"));
        let sha = tarball(&archive, &format!("{name}-1.0/configure"), configure);
        let deps: Vec<String> = deps.iter().map(|d| format!("\"{d}\"")).collect();
        let json = format!(
            r#"{{
                "name": "{name}",
                "version": "1.0",
                "desc": "Test formula {name}",
                "url": "file://{}",
                "sha256": "{sha}",
                "dependencies": [{}],
                "steps": [
                    {{"type": "extract"}},
                    {{"type": "configure", "args": ["--prefix={{prefix}}"]}},
                    {{"type": "install_files", "pattern": "built.txt", "dest": "share/{name}"}}
                ]
            }}"#,
            archive.display(),
            deps.join(", ")
        );
        fs::write(self.formula_dir().join(format!("{name}.json")), json).unwrap();
    }
}

fn tarball(path: &Path, entry: &str, contents: &str) -> String {
    let file = fs::File::create(path).unwrap();
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder
        .append_data(&mut header, entry, contents.as_bytes())
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
    hex::encode(Sha256::digest(fs::read(path).unwrap()))
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

const GOOD_CONFIGURE: &str = "#!/bin/sh\necho \"configured with $1\" > built.txt\n";
const BAD_CONFIGURE: &str = "#!/bin/sh\necho 'error: libfoo not found' >&2\nexit 1\n";

#[test]
fn unknown_subcommands_are_usage_errors() {
    let sandbox = Sandbox::new();
    assert_eq!(sandbox.keg(&["frobnicate"]).status.code(), Some(2));
    assert_eq!(sandbox.keg(&["install"]).status.code(), Some(2));
}

#[test]
fn installed_formulae_are_listed_until_uninstalled() {
    let sandbox = Sandbox::new();
    sandbox.add_source_formula("rabbitmq-c", &[], GOOD_CONFIGURE);
    sandbox.add_source_formula("amqp", &["rabbitmq-c"], GOOD_CONFIGURE);

    let install = sandbox.keg(&["install", "amqp"]);
    assert_eq!(install.status.code(), Some(0), "{}", stdout(&install));

    let list = stdout(&sandbox.keg(&["list"]));
    assert!(list.contains("amqp"));
    assert!(list.contains("rabbitmq-c"));

    // rabbitmq-c is still needed by amqp.
    assert_eq!(sandbox.keg(&["uninstall", "rabbitmq-c"]).status.code(), Some(1));

    assert_eq!(sandbox.keg(&["uninstall", "amqp"]).status.code(), Some(0));
    let list = stdout(&sandbox.keg(&["list"]));
    assert!(!list.contains("amqp"));
    assert!(list.contains("rabbitmq-c"));
}

#[test]
fn failing_configure_exits_with_one_and_shows_its_output() {
    let sandbox = Sandbox::new();
    sandbox.add_source_formula("broken", &[], BAD_CONFIGURE);

    let output = sandbox.keg(&["install", "broken"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stdout(&output).contains("libfoo not found"));
    assert!(!sandbox.prefix().join("Cellar/broken").exists());
}

#[test]
fn unknown_formulae_fail_without_installing_anything() {
    let sandbox = Sandbox::new();
    let output = sandbox.keg(&["install", "nope"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("nope"));
}

#[test]
fn info_reports_the_artifact_that_would_be_installed() {
    let sandbox = Sandbox::new();
    sandbox.add_source_formula("amqp", &[], GOOD_CONFIGURE);

    let output = sandbox.keg(&["info", "amqp"]);
    assert_eq!(output.status.code(), Some(0));
    let text = stdout(&output);
    assert!(text.contains("Test formula amqp"));
    assert!(text.contains("source"));
}
