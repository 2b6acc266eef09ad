// keg-core/src/build/executor.rs
// Drives one planned formula through fetch, verification, build and install.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use chrono::Utc;
use keg_aio::checksum::verify_checksum_sync;
use keg_aio::extract::{extract_archive, single_top_level_dir};
use keg_aio::fs::{create_dir_all, prune_empty_dirs, remove_path};
use keg_aio::process::run_command_captured;
use keg_aio::uninstall::remove_manifest;
use keg_common::cache::Cache;
use keg_common::config::Config;
use keg_common::error::{KegError, Result};
use keg_common::model::step::Step;
use keg_common::pipeline::{ArtifactChoice, BuildPhase, CancellationFlag, PlannedJob};
use keg_common::state::{InstallKind, InstallRecord, InstallStateStore};
use keg_net::{checkout_head, fetch_artifact_blocking, HeadCheckout};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::env::BuildEnvironment;
use super::steps::{confined_join, copy_tree, install_matching, write_into, StepContext};
use super::{write_receipt, InstallReceipt};
use crate::install::bottle::{link_keg, pour_bottle};

/// Lines of tool output carried in a build error.
const OUTPUT_TAIL_LINES: usize = 40;

enum FetchedSource {
    Archive(PathBuf),
    Checkout(HeadCheckout),
}

type PhaseObserver<'a> = Box<dyn Fn(BuildPhase) + Send + 'a>;

/// Single-use state machine installing one [`PlannedJob`].
///
/// Phases follow [`BuildPhase::can_transition_to`]; any error moves the
/// executor to `Failed`, removes the partial keg and discards the work
/// directory unless `keep_work_dir_on_failure` is set.
pub struct BuildExecutor<'a> {
    config: &'a Config,
    cache: &'a Cache,
    state: &'a InstallStateStore,
    cancel: CancellationFlag,
    observer: Option<PhaseObserver<'a>>,
    target: String,
    phase: BuildPhase,
    history: Vec<BuildPhase>,
}

impl<'a> BuildExecutor<'a> {
    pub fn new(
        config: &'a Config,
        cache: &'a Cache,
        state: &'a InstallStateStore,
        cancel: CancellationFlag,
    ) -> Self {
        Self {
            config,
            cache,
            state,
            cancel,
            observer: None,
            target: String::new(),
            phase: BuildPhase::Pending,
            history: vec![BuildPhase::Pending],
        }
    }

    /// Calls `observer` after every phase change.
    pub fn with_observer(mut self, observer: impl Fn(BuildPhase) + Send + 'a) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn phase(&self) -> BuildPhase {
        self.phase
    }

    pub fn history(&self) -> &[BuildPhase] {
        &self.history
    }

    /// Moves to `next`. Staying in the current phase is a no-op.
    pub fn advance(&mut self, next: BuildPhase) -> Result<()> {
        if next == self.phase {
            return Ok(());
        }
        if !self.phase.can_transition_to(next) {
            return Err(KegError::InvalidTransition {
                formula: self.target.clone(),
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        debug!("{}: {} -> {}", self.target, self.phase, next);
        self.phase = next;
        self.history.push(next);
        if let Some(observer) = &self.observer {
            observer(next);
        }
        Ok(())
    }

    /// Installs `job`. `download_path` is an artifact the download
    /// coordinator already fetched; without it the executor fetches itself.
    pub fn execute(
        &mut self,
        job: &PlannedJob,
        download_path: Option<&Path>,
    ) -> Result<InstallRecord> {
        if self.phase != BuildPhase::Pending {
            return Err(KegError::InvalidTransition {
                formula: job.target_id.clone(),
                from: self.phase.to_string(),
                to: BuildPhase::Fetching.to_string(),
            });
        }
        self.target = job.target_id.clone();
        info!("Installing {} from {}", job.target_id, job.artifact);
        match self.run(job, download_path) {
            Ok(record) => Ok(record),
            Err(e) => {
                if !self.phase.is_terminal() {
                    let _ = self.advance(BuildPhase::Failed);
                }
                error!("Install of {} failed: {}", job.target_id, e);
                Err(e)
            }
        }
    }

    fn run(&mut self, job: &PlannedJob, download_path: Option<&Path>) -> Result<InstallRecord> {
        self.cancel.check(&format!("install of {}", job.target_id))?;
        self.advance(BuildPhase::Fetching)?;
        let fetched = self.fetch(job, download_path)?;
        match (&job.artifact, fetched) {
            (ArtifactChoice::Bottle(bottle), FetchedSource::Archive(path)) => {
                self.verify(job, &path)?;
                self.cancel.check(&format!("install of {}", job.target_id))?;
                self.advance(BuildPhase::Unpacking)?;
                let formula = &job.node.formula;
                let version = formula.version_str_full();
                let keg = self.config.formula_keg_path(formula.name(), &version);
                if let Err(e) = pour_bottle(&path, formula, bottle, self.config) {
                    self.discard_keg(&keg);
                    return Err(e);
                }
                self.finish_or_discard(job, &keg, &version, InstallKind::Bottle)
            }
            (_, fetched) => self.build_from_source(job, fetched),
        }
    }

    fn fetch(&self, job: &PlannedJob, download_path: Option<&Path>) -> Result<FetchedSource> {
        let formula = &job.node.formula;
        if job.artifact == ArtifactChoice::Head {
            let head = formula.head.as_ref().ok_or_else(|| {
                KegError::InstallError(format!("{} has no HEAD source", formula.name()))
            })?;
            let checkout =
                checkout_head(self.cache, formula.name(), &head.url, head.branch.as_deref())?;
            debug!(
                "HEAD checkout of {} at {} ({})",
                formula.name(),
                checkout.path.display(),
                checkout.commit
            );
            return Ok(FetchedSource::Checkout(checkout));
        }
        if let Some(path) = download_path.filter(|p| p.is_file()) {
            debug!("Using prefetched artifact {}", path.display());
            return Ok(FetchedSource::Archive(path.to_path_buf()));
        }
        let mirrors = match job.artifact {
            ArtifactChoice::Source => formula.mirrors.clone(),
            _ => Vec::new(),
        };
        let path =
            fetch_artifact_blocking(self.cache, &job.target_id, &job.url, &mirrors, &job.sha256)?;
        Ok(FetchedSource::Archive(path))
    }

    fn verify(&mut self, job: &PlannedJob, path: &Path) -> Result<()> {
        self.advance(BuildPhase::Verifying)?;
        verify_checksum_sync(path, &job.sha256, &job.target_id)
    }

    fn build_from_source(
        &mut self,
        job: &PlannedJob,
        fetched: FetchedSource,
    ) -> Result<InstallRecord> {
        let formula = job.node.formula.clone();
        let name = formula.name();
        let (version, kind) = match &fetched {
            FetchedSource::Archive(path) => {
                self.verify(job, path)?;
                (formula.version_str_full(), InstallKind::Source)
            }
            FetchedSource::Checkout(checkout) => {
                (format!("HEAD-{}", checkout.short_sha()), InstallKind::Head)
            }
        };
        self.check_dependencies(job)?;

        let keg = self.config.formula_keg_path(name, &version);
        if keg.exists() {
            debug!("Removing previous keg {}", keg.display());
            remove_path(&keg)?;
        }
        create_dir_all(&keg)?;
        let tmp_root = self.config.tmp_dir();
        create_dir_all(&tmp_root)?;
        let work_dir = tempfile::Builder::new()
            .prefix(&format!("{name}-"))
            .tempdir_in(&tmp_root)?;
        debug!("Build directory for {}: {}", name, work_dir.path().display());

        if let Err(e) = self.run_steps(job, &fetched, &keg, work_dir.path(), &version) {
            if self.config.keep_work_dir_on_failure {
                let kept = work_dir.into_path();
                warn!("Keeping build directory of {} at {}", name, kept.display());
            } else if let Err(close_err) = work_dir.close() {
                warn!("Could not remove build directory of {}: {}", name, close_err);
            }
            self.discard_keg(&keg);
            return Err(e);
        }
        if let Err(e) = work_dir.close() {
            warn!("Could not remove build directory of {}: {}", name, e);
        }
        self.finish_or_discard(job, &keg, &version, kind)
    }

    fn check_dependencies(&self, job: &PlannedJob) -> Result<()> {
        let formula = &job.node.formula;
        for dep_name in &job.node.dependencies {
            let constraint = formula
                .dependencies
                .iter()
                .find(|d| &d.name == dep_name)
                .and_then(|d| d.constraint.as_ref());
            if self.state.find_satisfying(dep_name, constraint).is_none() {
                return Err(KegError::DependencyUnsatisfied {
                    formula: formula.name().to_string(),
                    dependency: dep_name.clone(),
                });
            }
        }
        Ok(())
    }

    fn run_steps(
        &mut self,
        job: &PlannedJob,
        fetched: &FetchedSource,
        keg: &Path,
        work_dir: &Path,
        version: &str,
    ) -> Result<()> {
        let formula = job.node.formula.clone();
        let name = formula.name();
        let ctx = StepContext::new(self.config, name, version, keg, work_dir)?;
        let env = BuildEnvironment::new(self.config, &job.node.dependencies);
        let mut cwd = work_dir.to_path_buf();

        for step in &formula.install_steps {
            if *step == Step::Download {
                // Satisfied by the fetch phase.
                continue;
            }
            self.cancel.check(&format!("build of {name}"))?;
            self.advance(step.phase())?;
            debug!("{}: {} (cwd {})", name, step.label(), cwd.display());
            match step {
                Step::Download => {}
                Step::Extract => cwd = unpack_source(fetched, work_dir, name)?,
                Step::Chdir { path } => {
                    let next = cwd.join(ctx.expand(path));
                    if !next.is_dir() {
                        return Err(step_error(
                            name,
                            step,
                            None,
                            format!("{} is not a directory", next.display()),
                        ));
                    }
                    cwd = next;
                }
                Step::Run { program, args } => {
                    let program = resolve_program(&ctx.expand(program), &cwd);
                    run_tool(name, step, &program, &ctx.expand_all(args), &cwd, env.vars())?;
                }
                Step::Configure { args } => {
                    let script = cwd.join("configure").to_string_lossy().into_owned();
                    run_tool(name, step, &script, &ctx.expand_all(args), &cwd, env.vars())?;
                }
                Step::Make { args } => {
                    run_tool(name, step, "make", &ctx.expand_all(args), &cwd, env.vars())?;
                }
                Step::InstallFiles { pattern, dest } => {
                    let dest_dir = confined_join(keg, &ctx.expand(dest))?;
                    let pattern = ctx.expand(pattern);
                    if install_matching(&cwd, &pattern, &dest_dir)? == 0 {
                        return Err(step_error(
                            name,
                            step,
                            None,
                            format!("nothing matched '{pattern}' in {}", cwd.display()),
                        ));
                    }
                }
                Step::WriteFile { path, contents } => {
                    write_into(keg, &ctx.expand(path), &ctx.expand(contents))?;
                }
            }
        }
        Ok(())
    }

    fn finish_or_discard(
        &mut self,
        job: &PlannedJob,
        keg: &Path,
        version: &str,
        kind: InstallKind,
    ) -> Result<InstallRecord> {
        self.finish(job, keg, version, kind).inspect_err(|_| self.discard_keg(keg))
    }

    fn finish(
        &mut self,
        job: &PlannedJob,
        keg: &Path,
        version: &str,
        kind: InstallKind,
    ) -> Result<InstallRecord> {
        let name = job.node.name().to_string();
        self.cancel.check(&format!("install of {name}"))?;
        self.advance(BuildPhase::Installing)?;

        let installed_on_request = job.node.requested
            || self
                .state
                .get(&name, version)
                .is_some_and(|r| r.installed_on_request);
        let installed_at = Utc::now();
        write_receipt(
            keg,
            &InstallReceipt {
                name: name.clone(),
                version: version.to_string(),
                install_kind: kind,
                installed_at,
                installed_on_request,
                source_url: job.url.clone(),
                source_sha256: job.sha256.clone(),
                runtime_dependencies: job.node.runtime_dependencies.clone(),
            },
        )?;

        let links = link_keg(&name, keg, self.config)?;
        let mut manifest: BTreeSet<PathBuf> = WalkDir::new(keg)
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .collect();
        manifest.extend(links.iter().cloned());

        let record = InstallRecord {
            name: name.clone(),
            version: version.to_string(),
            keg_path: keg.to_path_buf(),
            manifest,
            installed_at,
            install_kind: kind,
            installed_on_request,
            runtime_dependencies: job.node.runtime_dependencies.clone(),
        };
        if let Err(e) = self.state.record(record.clone()) {
            if let Err(unlink_err) = remove_manifest(&links, self.config.keg_root()) {
                warn!("Could not remove links of {}: {}", name, unlink_err);
            }
            return Err(e);
        }
        self.advance(BuildPhase::Done)?;
        info!("Installed {} {} ({})", name, version, kind);
        Ok(record)
    }

    fn discard_keg(&self, keg: &Path) {
        debug!("Discarding partial keg {}", keg.display());
        if let Err(e) = remove_path(keg) {
            warn!("Could not remove partial keg {}: {}", keg.display(), e);
            return;
        }
        if let Some(parent) = keg.parent() {
            let _ = prune_empty_dirs(parent, &self.config.cellar_dir());
        }
    }
}

fn unpack_source(fetched: &FetchedSource, work_dir: &Path, name: &str) -> Result<PathBuf> {
    match fetched {
        FetchedSource::Archive(archive) => {
            extract_archive(archive, work_dir, 0)?;
            Ok(single_top_level_dir(work_dir).unwrap_or_else(|| work_dir.to_path_buf()))
        }
        FetchedSource::Checkout(checkout) => {
            let dest = work_dir.join(format!("{name}-HEAD"));
            copy_tree(&checkout.path, &dest)?;
            Ok(dest)
        }
    }
}

/// Relative programs with a path separator (`./buildconf`) resolve against
/// the working directory; bare names go through `PATH`.
fn resolve_program(program: &str, cwd: &Path) -> String {
    let path = Path::new(program);
    if path.is_relative() && path.components().count() > 1 {
        cwd.join(path).to_string_lossy().into_owned()
    } else {
        program.to_string()
    }
}

fn run_tool(
    formula: &str,
    step: &Step,
    program: &str,
    args: &[String],
    cwd: &Path,
    envs: &HashMap<String, String>,
) -> Result<()> {
    let output = run_command_captured(program, args, cwd, envs, OUTPUT_TAIL_LINES)
        .map_err(|e| step_error(formula, step, None, e.to_string()))?;
    if output.success() {
        return Ok(());
    }
    Err(step_error(
        formula,
        step,
        output.exit_code(),
        output.tail(),
    ))
}

fn step_error(formula: &str, step: &Step, exit_code: Option<i32>, output_tail: String) -> KegError {
    KegError::Build {
        formula: formula.to_string(),
        step: step.label(),
        exit_code,
        output_tail,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use keg_aio::checksum::sha256_hex;
    use keg_common::dependency::{NodeInstallStrategy, PlanNode};
    use keg_common::model::FormulaDescriptor;

    use super::*;

    struct Fixture {
        root: tempfile::TempDir,
        config: Config,
        cache: Cache,
        state: InstallStateStore,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let config = Config::with_root(root.path().join("prefix"));
        let cache = Cache::new(&config).unwrap();
        let state = InstallStateStore::from_config(&config).unwrap();
        Fixture {
            root,
            config,
            cache,
            state,
        }
    }

    fn source_tarball(path: &Path, configure: &str) -> String {
        let file = fs::File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(configure.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "widget-1.0/configure", configure.as_bytes())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
        sha256_hex(&fs::read(path).unwrap())
    }

    fn job(tarball: &Path, sha256: &str) -> PlannedJob {
        let json = format!(
            r#"{{
                "name": "widget",
                "version": "1.0",
                "url": "file://{}",
                "sha256": "{sha256}",
                "steps": [
                    {{"type": "download"}},
                    {{"type": "extract"}},
                    {{"type": "configure", "args": ["--prefix={{prefix}}"]}},
                    {{"type": "install_files", "pattern": "built.txt", "dest": "share/widget"}},
                    {{"type": "write_file", "path": "etc/widget.conf", "contents": "name={{name}}"}}
                ]
            }}"#,
            tarball.display()
        );
        let formula = FormulaDescriptor::from_json(&json)
            .unwrap()
            .resolve(&HashMap::new())
            .unwrap();
        PlannedJob {
            target_id: "widget".into(),
            url: formula.url.clone(),
            sha256: sha256.to_string(),
            artifact: ArtifactChoice::Source,
            node: PlanNode {
                formula: Arc::new(formula),
                strategy: NodeInstallStrategy::SourceOnly,
                requested: true,
                build_only: false,
                head: false,
                dependencies: vec![],
                runtime_dependencies: vec![],
            },
        }
    }

    #[test]
    fn phases_only_move_forward() {
        let fx = fixture();
        let mut exec = BuildExecutor::new(&fx.config, &fx.cache, &fx.state, CancellationFlag::new());
        exec.advance(BuildPhase::Fetching).unwrap();
        exec.advance(BuildPhase::Fetching).unwrap();
        assert!(matches!(
            exec.advance(BuildPhase::Pending),
            Err(KegError::InvalidTransition { .. })
        ));
        assert!(matches!(
            exec.advance(BuildPhase::Done),
            Err(KegError::InvalidTransition { .. })
        ));
        assert_eq!(exec.history(), &[BuildPhase::Pending, BuildPhase::Fetching]);
    }

    #[test]
    fn source_build_installs_links_and_records() {
        let fx = fixture();
        let tarball = fx.root.path().join("widget-1.0.tar.gz");
        let sha = source_tarball(
            &tarball,
            "#!/bin/sh\necho \"configured with $1\" > built.txt\n",
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut exec = BuildExecutor::new(&fx.config, &fx.cache, &fx.state, CancellationFlag::new())
            .with_observer(move |p| sink.lock().unwrap().push(p));

        let record = exec.execute(&job(&tarball, &sha), None).unwrap();

        let keg = fx.config.formula_keg_path("widget", "1.0.0");
        assert_eq!(record.keg_path, keg);
        assert_eq!(record.install_kind, InstallKind::Source);
        let built = fs::read_to_string(keg.join("share/widget/built.txt")).unwrap();
        assert_eq!(built.trim(), format!("configured with --prefix={}", keg.display()));
        assert_eq!(
            fs::read_to_string(keg.join("etc/widget.conf")).unwrap(),
            "name=widget"
        );
        assert!(keg.join(super::super::RECEIPT_FILE_NAME).is_file());
        assert!(record.manifest.contains(&fx.config.formula_opt_path("widget")));
        assert!(fx.state.is_installed("widget", None));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                BuildPhase::Fetching,
                BuildPhase::Verifying,
                BuildPhase::Extracting,
                BuildPhase::Configuring,
                BuildPhase::Installing,
                BuildPhase::Done,
            ]
        );
        assert_eq!(fs::read_dir(fx.config.tmp_dir()).unwrap().count(), 0);
    }

    #[test]
    fn failing_configure_cleans_up_and_reports_output() {
        let fx = fixture();
        let tarball = fx.root.path().join("widget-1.0.tar.gz");
        let sha = source_tarball(
            &tarball,
            "#!/bin/sh\necho 'configure: error: librabbitmq not found' >&2\nexit 1\n",
        );
        let mut exec = BuildExecutor::new(&fx.config, &fx.cache, &fx.state, CancellationFlag::new());

        let err = exec.execute(&job(&tarball, &sha), None).unwrap_err();
        match &err {
            KegError::Build {
                step,
                exit_code,
                output_tail,
                ..
            } => {
                assert_eq!(step, "configure");
                assert_eq!(*exit_code, Some(1));
                assert!(output_tail.contains("librabbitmq not found"));
            }
            other => panic!("expected build error, got {other:?}"),
        }
        assert_eq!(exec.phase(), BuildPhase::Failed);
        assert!(!fx.config.formula_cellar_dir("widget").exists());
        assert_eq!(fs::read_dir(fx.config.tmp_dir()).unwrap().count(), 0);
        assert!(!fx.state.is_installed("widget", None));
    }

    #[test]
    fn keep_work_dir_preserves_the_build_tree() {
        let mut fx = fixture();
        fx.config.keep_work_dir_on_failure = true;
        let tarball = fx.root.path().join("widget-1.0.tar.gz");
        let sha = source_tarball(&tarball, "#!/bin/sh\nexit 3\n");
        let mut exec = BuildExecutor::new(&fx.config, &fx.cache, &fx.state, CancellationFlag::new());
        assert!(exec.execute(&job(&tarball, &sha), None).is_err());
        let kept: Vec<_> = fs::read_dir(fx.config.tmp_dir()).unwrap().collect();
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn corrupt_archive_fails_verification() {
        let fx = fixture();
        let tarball = fx.root.path().join("widget-1.0.tar.gz");
        source_tarball(&tarball, "#!/bin/sh\n");
        let wrong = "0".repeat(64);
        let mut exec = BuildExecutor::new(&fx.config, &fx.cache, &fx.state, CancellationFlag::new());
        let err = exec.execute(&job(&tarball, &wrong), Some(&tarball)).unwrap_err();
        assert!(matches!(err, KegError::ChecksumMismatch { ref subject, .. } if subject == "widget"));
        assert_eq!(
            exec.history(),
            &[
                BuildPhase::Pending,
                BuildPhase::Fetching,
                BuildPhase::Verifying,
                BuildPhase::Failed
            ]
        );
    }

    #[test]
    fn missing_dependency_is_reported_before_building() {
        let fx = fixture();
        let tarball = fx.root.path().join("widget-1.0.tar.gz");
        let sha = source_tarball(&tarball, "#!/bin/sh\n");
        let mut planned = job(&tarball, &sha);
        planned.node.dependencies = vec!["rabbitmq-c".into()];
        let mut exec = BuildExecutor::new(&fx.config, &fx.cache, &fx.state, CancellationFlag::new());
        let err = exec.execute(&planned, None).unwrap_err();
        assert!(matches!(err, KegError::DependencyUnsatisfied { ref dependency, .. } if dependency == "rabbitmq-c"));
    }

    #[test]
    fn cancelled_before_start_never_fetches() {
        let fx = fixture();
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let tarball = fx.root.path().join("missing.tar.gz");
        let mut exec = BuildExecutor::new(&fx.config, &fx.cache, &fx.state, cancel);
        let err = exec.execute(&job(&tarball, &"0".repeat(64)), None).unwrap_err();
        assert!(matches!(err, KegError::Cancelled(_)));
        assert_eq!(exec.history(), &[BuildPhase::Pending, BuildPhase::Failed]);
    }
}
