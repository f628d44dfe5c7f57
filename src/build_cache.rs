//! Build-and-run engine behind the `run` command.
//!
//! A program directory holds C sources and, after a successful build, the
//! binary `main`. The binary is rebuilt only when it is missing or when some
//! source has a modification time strictly newer than it. A source edited and
//! then given an older timestamp is not noticed; that is the accepted cost of
//! the mtime policy.
//!
//! Concurrent `run`s of the same directory are serialized by a per-directory
//! lock held from the staleness check until the program exits.

use anyhow::{Context, Result};
use filetime::FileTime;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command as ProcessCommand;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::command::Command;
use crate::config::Settings;
use crate::exec::{cap_output, capture};
use crate::protocol::BINARY_NAME;
use crate::protocol_core::{normalize_under_root, with_elapsed};

pub const MISSING_DIR: &str = "Can't run/compile as the directory doesn't exist\n";

/// `run <dir> [args...] [-f <localfile>]`, split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub dir: String,
    /// Arguments handed to `./main`.
    pub program_args: Vec<String>,
    /// Client-side file the reply is saved to (`<name>.txt`).
    pub local_file: Option<String>,
    /// Tokens on the original line, verb included.
    pub token_count: usize,
}

impl RunRequest {
    pub fn parse(command: &Command) -> Result<Self, String> {
        let Some((dir, rest)) = command.args.split_first() else {
            return Err("run usage: \"run progname [args] [-f localfile]\"\n".to_string());
        };
        let mut program_args = Vec::with_capacity(rest.len());
        let mut local_file = None;
        let mut iter = rest.iter();
        while let Some(arg) = iter.next() {
            if arg == "-f" && local_file.is_none() {
                match iter.next() {
                    Some(name) => local_file = Some(name.clone()),
                    None => return Err("run: -f needs a local file name\n".to_string()),
                }
            } else {
                program_args.push(arg.clone());
            }
        }
        Ok(Self {
            dir: dir.clone(),
            program_args,
            local_file,
            token_count: command.token_count(),
        })
    }

    /// Local path the client saves the reply under, if `-f` was given.
    pub fn local_path(&self, local_root: &Path) -> Option<PathBuf> {
        self.local_file
            .as_ref()
            .map(|name| local_root.join(format!("{name}.txt")))
    }
}

/// Why a build is or is not needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    MissingBinary,
    NewerSource(PathBuf),
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        !matches!(self, Staleness::Fresh)
    }
}

/// The cached binary of one program directory.
#[derive(Debug, Clone)]
pub struct BuildArtifact {
    dir: PathBuf,
    source_ext: String,
}

impl BuildArtifact {
    pub fn new(dir: impl Into<PathBuf>, source_ext: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            source_ext: source_ext.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn binary(&self) -> PathBuf {
        self.dir.join(BINARY_NAME)
    }

    /// Source files directly inside the program directory, sorted by name.
    pub fn sources(&self) -> Result<Vec<PathBuf>> {
        let mut sources = Vec::new();
        for entry in WalkDir::new(&self.dir).min_depth(1).max_depth(1) {
            let entry = entry.with_context(|| format!("scan {}", self.dir.display()))?;
            let is_source = entry.file_type().is_file()
                && entry.path().extension().and_then(|e| e.to_str())
                    == Some(self.source_ext.as_str());
            if is_source {
                sources.push(entry.into_path());
            }
        }
        sources.sort();
        Ok(sources)
    }

    pub fn staleness(&self) -> Result<Staleness> {
        let binary = match std::fs::metadata(self.binary()) {
            Ok(md) => FileTime::from_last_modification_time(&md),
            Err(_) => return Ok(Staleness::MissingBinary),
        };
        for source in self.sources()? {
            let md = std::fs::metadata(&source)
                .with_context(|| format!("stat {}", source.display()))?;
            if FileTime::from_last_modification_time(&md) > binary {
                return Ok(Staleness::NewerSource(source));
            }
        }
        Ok(Staleness::Fresh)
    }
}

/// Per-directory async locks, created on first use.
#[derive(Default)]
pub struct BuildLocks {
    inner: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl BuildLocks {
    pub fn lock_for(&self, dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock();
        // Drop entries nobody holds any more
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(map.entry(dir.to_path_buf()).or_default())
    }
}

/// Result of one `run` invocation.
#[derive(Debug)]
pub struct RunOutcome {
    pub reply: Vec<u8>,
    pub rebuilt: bool,
    pub dir: PathBuf,
}

/// Compiles and runs programs under the daemon root.
pub struct Builder {
    root: PathBuf,
    compiler: String,
    source_ext: String,
    reply_limit: usize,
    locks: BuildLocks,
}

impl Builder {
    pub fn new(root: &Path, settings: &Settings) -> Self {
        Self {
            root: root.to_path_buf(),
            compiler: settings.compiler.clone(),
            source_ext: settings.source_ext.clone(),
            reply_limit: settings.reply_limit,
            locks: BuildLocks::default(),
        }
    }

    pub async fn run(&self, request: &RunRequest) -> RunOutcome {
        let start = Instant::now();
        let dir = match normalize_under_root(&self.root, Path::new(&request.dir)) {
            Ok(dir) => dir,
            Err(e) => {
                return RunOutcome {
                    reply: format!("Can't run/compile: {:#}\n", e).into_bytes(),
                    rebuilt: false,
                    dir: self.root.join(&request.dir),
                }
            }
        };
        // Only enforced when arguments follow the directory
        if request.token_count > 2 && !dir.is_dir() {
            return RunOutcome {
                reply: MISSING_DIR.as_bytes().to_vec(),
                rebuilt: false,
                dir,
            };
        }

        let lock = self.locks.lock_for(&dir);
        let _guard = lock.lock().await;

        let artifact = BuildArtifact::new(&dir, self.source_ext.as_str());
        let staleness = match artifact.staleness() {
            Ok(s) => s,
            Err(e) => {
                return RunOutcome {
                    reply: with_elapsed(format!("{:#}", e).into_bytes(), start.elapsed()),
                    rebuilt: false,
                    dir,
                }
            }
        };
        debug!(dir = %dir.display(), ?staleness, "staleness check");

        let mut output = Vec::new();
        let rebuilt = staleness.is_stale();
        if rebuilt {
            info!(dir = %dir.display(), ?staleness, "rebuilding");
            match self.compile(&artifact).await {
                Ok(captured) => {
                    output.extend_from_slice(&captured.output);
                    if !captured.success {
                        return self.finish(output, start, rebuilt, dir);
                    }
                }
                Err(e) => {
                    output.extend_from_slice(format!("{:#}\n", e).as_bytes());
                    return self.finish(output, start, rebuilt, dir);
                }
            }
        }

        let mut program = ProcessCommand::new(artifact.binary());
        program.args(&request.program_args).current_dir(&dir);
        match capture(program).await {
            Ok(captured) => output.extend_from_slice(&captured.output),
            Err(e) => output.extend_from_slice(format!("{:#}\n", e).as_bytes()),
        }
        self.finish(output, start, rebuilt, dir)
    }

    async fn compile(&self, artifact: &BuildArtifact) -> Result<crate::exec::Captured> {
        let sources = artifact.sources()?;
        let mut words = self.compiler.split_whitespace();
        let program = words.next().context("no compiler configured")?;
        let mut cc = ProcessCommand::new(program);
        cc.args(words);
        for source in &sources {
            // Relative names keep diagnostics identical to a local build
            cc.arg(source.file_name().unwrap_or(source.as_os_str()));
        }
        cc.arg("-o").arg(BINARY_NAME).current_dir(artifact.dir());
        capture(cc)
            .await
            .with_context(|| format!("failed to start compiler {}", self.compiler))
    }

    fn finish(&self, output: Vec<u8>, start: Instant, rebuilt: bool, dir: PathBuf) -> RunOutcome {
        RunOutcome {
            reply: with_elapsed(cap_output(output, self.reply_limit, "run"), start.elapsed()),
            rebuilt,
            dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, SystemTime};

    fn set_mtime(path: &Path, t: SystemTime) {
        filetime::set_file_mtime(path, FileTime::from_system_time(t)).unwrap();
    }

    #[test]
    fn run_request_strips_local_redirect() {
        let cmd = Command::parse("run prog 1 2 -f out 3").unwrap();
        let req = RunRequest::parse(&cmd).unwrap();
        assert_eq!(req.dir, "prog");
        assert_eq!(req.program_args, vec!["1", "2", "3"]);
        assert_eq!(req.local_file.as_deref(), Some("out"));
        assert_eq!(req.token_count, 7);
        assert_eq!(req.local_path(Path::new("/tmp")), Some(PathBuf::from("/tmp/out.txt")));
    }

    #[test]
    fn run_request_errors() {
        assert!(RunRequest::parse(&Command::parse("run").unwrap()).is_err());
        assert!(RunRequest::parse(&Command::parse("run prog -f").unwrap()).is_err());
        let plain = RunRequest::parse(&Command::parse("run prog").unwrap()).unwrap();
        assert!(plain.program_args.is_empty());
        assert!(plain.local_file.is_none());
    }

    #[test]
    fn sources_only_match_extension_at_top_level() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.c"), "").unwrap();
        fs::write(dir.path().join("a.c"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/c.c"), "").unwrap();

        let artifact = BuildArtifact::new(dir.path(), "c");
        let names: Vec<_> = artifact
            .sources()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.c", "b.c"]);
    }

    #[test]
    fn staleness_follows_modification_times() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("prog.c");
        let bin = dir.path().join(BINARY_NAME);
        fs::write(&src, "int main(void){return 0;}").unwrap();
        let artifact = BuildArtifact::new(dir.path(), "c");

        assert_eq!(artifact.staleness().unwrap(), Staleness::MissingBinary);

        fs::write(&bin, "").unwrap();
        let now = SystemTime::now();
        set_mtime(&src, now - Duration::from_secs(60));
        set_mtime(&bin, now);
        assert_eq!(artifact.staleness().unwrap(), Staleness::Fresh);

        // Equal times are not newer
        set_mtime(&src, now);
        assert_eq!(artifact.staleness().unwrap(), Staleness::Fresh);

        set_mtime(&src, now + Duration::from_secs(5));
        assert_eq!(artifact.staleness().unwrap(), Staleness::NewerSource(src.clone()));

        // An edit stamped with an older time goes unnoticed
        fs::write(&src, "int main(void){return 1;}").unwrap();
        set_mtime(&src, now - Duration::from_secs(120));
        assert!(!artifact.staleness().unwrap().is_stale());
    }

    #[test]
    fn locks_are_shared_per_directory() {
        let locks = BuildLocks::default();
        let a1 = locks.lock_for(Path::new("/r/a"));
        let a2 = locks.lock_for(Path::new("/r/a"));
        let b = locks.lock_for(Path::new("/r/b"));
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }

    #[cfg(unix)]
    mod fake_compiler {
        use super::*;

        // A "compiler" that records each call and emits a shell script as `main`.
        fn install(tools: &Path, log: &Path) -> String {
            let script = tools.join("fakecc");
            fs::write(
                &script,
                format!(
                    "echo \"$@\" >> {log}\n\
                     out=main\n\
                     while [ $# -gt 0 ]; do\n\
                       if [ \"$1\" = \"-o\" ]; then out=\"$2\"; shift; fi\n\
                       shift\n\
                     done\n\
                     printf '#!/bin/sh\\necho \"ran with: $*\"\\n' > \"$out\"\n\
                     chmod +x \"$out\"\n",
                    log = log.display()
                ),
            )
            .unwrap();
            format!("sh {}", script.display())
        }

        fn calls(log: &Path) -> usize {
            fs::read_to_string(log).map(|s| s.lines().count()).unwrap_or(0)
        }

        fn builder(root: &Path, compiler: String) -> Builder {
            let settings = Settings {
                compiler,
                ..Settings::default()
            };
            Builder::new(&root.canonicalize().unwrap(), &settings)
        }

        fn run_line(line: &str) -> RunRequest {
            RunRequest::parse(&Command::parse(line).unwrap()).unwrap()
        }

        #[tokio::test]
        async fn builds_once_then_reuses_binary() {
            let root = tempfile::tempdir().unwrap();
            let tools = tempfile::tempdir().unwrap();
            let log = tools.path().join("calls.log");
            let prog = root.path().join("prog");
            fs::create_dir(&prog).unwrap();
            fs::write(prog.join("prog.c"), "int main(void){return 0;}").unwrap();
            set_mtime(&prog.join("prog.c"), SystemTime::now() - Duration::from_secs(60));
            let builder = builder(root.path(), install(tools.path(), &log));

            let first = builder.run(&run_line("run prog 1 2")).await;
            assert!(first.rebuilt);
            let text = String::from_utf8(first.reply).unwrap();
            assert!(text.contains("ran with: 1 2"), "{text}");
            assert!(text.contains("Took: "));
            assert_eq!(calls(&log), 1);
            assert_eq!(fs::read_to_string(&log).unwrap().trim(), "prog.c -o main");

            let second = builder.run(&run_line("run prog 3")).await;
            assert!(!second.rebuilt);
            assert!(String::from_utf8(second.reply).unwrap().contains("ran with: 3"));
            assert_eq!(calls(&log), 1);

            set_mtime(&prog.join("prog.c"), SystemTime::now() + Duration::from_secs(30));
            let third = builder.run(&run_line("run prog")).await;
            assert!(third.rebuilt);
            assert_eq!(calls(&log), 2);
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
        async fn concurrent_runs_of_a_stale_directory_compile_once() {
            let root = tempfile::tempdir().unwrap();
            let tools = tempfile::tempdir().unwrap();
            let log = tools.path().join("calls.log");
            let prog = root.path().join("prog");
            fs::create_dir(&prog).unwrap();
            fs::write(prog.join("prog.c"), "int main(void){return 0;}").unwrap();
            set_mtime(&prog.join("prog.c"), SystemTime::now() - Duration::from_secs(60));
            let builder = builder(root.path(), install(tools.path(), &log));

            let first = run_line("run prog 1");
            let second = run_line("run prog 2");
            let (a, b) = tokio::join!(builder.run(&first), builder.run(&second));

            assert_eq!(calls(&log), 1);
            assert_eq!(u8::from(a.rebuilt) + u8::from(b.rebuilt), 1);
            assert!(String::from_utf8(a.reply).unwrap().contains("ran with: 1"));
            assert!(String::from_utf8(b.reply).unwrap().contains("ran with: 2"));
        }

        #[tokio::test]
        async fn missing_directory_with_arguments_is_refused() {
            let root = tempfile::tempdir().unwrap();
            let tools = tempfile::tempdir().unwrap();
            let log = tools.path().join("calls.log");
            let builder = builder(root.path(), install(tools.path(), &log));

            let outcome = builder.run(&run_line("run ghost 1")).await;
            assert_eq!(outcome.reply, MISSING_DIR.as_bytes());
            assert_eq!(calls(&log), 0);
        }

        #[tokio::test]
        async fn compiler_diagnostics_are_the_reply() {
            let root = tempfile::tempdir().unwrap();
            let tools = tempfile::tempdir().unwrap();
            let script = tools.path().join("badcc");
            fs::write(&script, "echo 'prog.c:1: error: expected ;' 1>&2\nexit 1\n").unwrap();
            let prog = root.path().join("prog");
            fs::create_dir(&prog).unwrap();
            fs::write(prog.join("prog.c"), "int main(").unwrap();
            let builder = builder(root.path(), format!("sh {}", script.display()));

            let outcome = builder.run(&run_line("run prog")).await;
            assert!(outcome.rebuilt);
            let text = String::from_utf8(outcome.reply).unwrap();
            assert!(text.starts_with("prog.c:1: error: expected ;\n"));
            assert!(!prog.join(BINARY_NAME).exists());
        }

        #[tokio::test]
        async fn parent_escape_is_refused() {
            let root = tempfile::tempdir().unwrap();
            let builder = builder(root.path(), "cc".into());
            let outcome = builder.run(&run_line("run ../x")).await;
            assert!(String::from_utf8(outcome.reply).unwrap().starts_with("Can't run/compile: "));
        }
    }
}
