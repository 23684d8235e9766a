//! Command line entry point.

use crate::backend::local::LocalBackend;
use crate::backend::resources::ResourcePool;
use crate::backend::scheduler::Scheduler;
use crate::cache::{dir::DirCache, Cache, CacheMode};
use crate::canon::{Location, RepoRoot};
use crate::config::{Config, CONFIG_FILE};
use crate::engine::Engine;
use crate::graph::JobId;
use crate::hash::ExplainHash;
use crate::job_support::JobClient;
use crate::progress::ConsoleProgress;
use crate::rules::{load, RuleTable};
use crate::store::Store;
use crate::{autodep, logging, signal};
use anyhow::{anyhow, bail};
use argh::FromArgs;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// an incremental build engine with dynamic dependency discovery
#[derive(FromArgs)]
struct Args {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    #[argh(subcommand)]
    cmd: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Build(BuildArgs),
    Status(StatusArgs),
    Forget(ForgetArgs),
    Freeze(FreezeArgs),
    Depend(DependArgs),
    Target(TargetArgs),
    CheckDeps(CheckDepsArgs),
    Encode(EncodeArgs),
    Decode(DecodeArgs),
}

const SUBCOMMANDS: &[&str] = &[
    "build",
    "status",
    "forget",
    "freeze",
    "depend",
    "target",
    "check-deps",
    "encode",
    "decode",
    "help",
];

/// bring goals up to date (the default command)
#[derive(FromArgs)]
#[argh(subcommand, name = "build")]
struct BuildArgs {
    /// parallelism: cpu capacity of the local backend
    #[argh(option, short = 'j')]
    jobs: Option<u64>,

    /// cache use: none, download, upload or plain [default=plain]
    #[argh(option, default = "CacheMode::Plain")]
    cache_mode: CacheMode,

    /// also write the diagnostic log to <admin dir>/log
    #[argh(switch)]
    log_file: bool,

    /// paths to build
    #[argh(positional)]
    goals: Vec<String>,
}

/// tell whether goals are up to date, without building anything
#[derive(FromArgs)]
#[argh(subcommand, name = "status")]
struct StatusArgs {
    /// print what goes into the digest of each job
    #[argh(switch)]
    explain: bool,

    /// paths to check
    #[argh(positional)]
    goals: Vec<String>,
}

/// forget the history of the jobs producing these paths, so they rerun
#[derive(FromArgs)]
#[argh(subcommand, name = "forget")]
struct ForgetArgs {
    #[argh(positional)]
    targets: Vec<String>,
}

/// pin paths as sources, never to be rebuilt
#[derive(FromArgs)]
#[argh(subcommand, name = "freeze")]
struct FreezeArgs {
    /// unpin instead
    #[argh(switch)]
    off: bool,

    #[argh(positional)]
    paths: Vec<String>,
}

/// (inside a job) declare deps and wait until they are up to date
#[derive(FromArgs)]
#[argh(subcommand, name = "depend")]
struct DependArgs {
    /// dep flag, e.g. critical, ignore_error, required, essential
    #[argh(option, long = "flag")]
    flags: Vec<String>,

    #[argh(positional)]
    paths: Vec<String>,
}

/// (inside a job) declare additional targets
#[derive(FromArgs)]
#[argh(subcommand, name = "target")]
struct TargetArgs {
    /// target flag, e.g. incremental, phony, optional
    #[argh(option, long = "flag")]
    flags: Vec<String>,

    #[argh(positional)]
    paths: Vec<String>,
}

/// (inside a job) wait until every dep seen so far is up to date
#[derive(FromArgs)]
#[argh(subcommand, name = "check-deps")]
struct CheckDepsArgs {}

/// (inside a job) get the code of a value in a codec file
#[derive(FromArgs)]
#[argh(subcommand, name = "encode")]
struct EncodeArgs {
    /// codec file
    #[argh(option)]
    file: String,
    /// context within the file
    #[argh(option)]
    ctx: String,
    /// minimum code length
    #[argh(option)]
    min_len: Option<usize>,
    #[argh(positional)]
    value: String,
}

/// (inside a job) get the value of a code in a codec file
#[derive(FromArgs)]
#[argh(subcommand, name = "decode")]
struct DecodeArgs {
    /// codec file
    #[argh(option)]
    file: String,
    /// context within the file
    #[argh(option)]
    ctx: String,
    #[argh(positional)]
    code: String,
}

/// Insert `build` when no subcommand is named, so that `dynmake goal`
/// builds.
fn with_default_command(mut args: Vec<String>) -> Vec<String> {
    let mut i = 0;
    while i < args.len() {
        let a = args[i].as_str();
        if a == "-C" {
            i += 2;
            continue;
        }
        if SUBCOMMANDS.contains(&a) || a == "--help" || a == "-h" {
            return args;
        }
        break;
    }
    args.insert(i.min(args.len()), "build".to_string());
    args
}

/// A repository opened for a command.
struct Repo {
    root: RepoRoot,
    config: Config,
    rules: RuleTable,
}

/// The nearest enclosing directory holding a config or rules file.
fn find_root(cwd: &Path) -> anyhow::Result<PathBuf> {
    for dir in cwd.ancestors() {
        if dir.join(CONFIG_FILE).exists() || dir.join("rules.json").exists() {
            return Ok(dir.to_path_buf());
        }
    }
    bail!(
        "no {} or rules.json in {} or its parents",
        CONFIG_FILE,
        cwd.display()
    )
}

impl Repo {
    fn open(cwd: &Path) -> anyhow::Result<Repo> {
        let top = find_root(cwd)?;
        let config = Config::load(&top)?;
        let root = RepoRoot::new(top, &config.engine.admin_dir);
        let rules = load::read(&root.abs(&config.engine.rules))?;
        Ok(Repo {
            root,
            config,
            rules,
        })
    }

    /// The node name of a path given on the command line.
    fn node_name(&self, cwd: &Path, path: &str) -> anyhow::Result<String> {
        match self.root.locate(cwd, Path::new(path)) {
            Location::Repo(name) => Ok(name),
            Location::Admin => bail!("{} is inside the admin directory", path),
            Location::External => bail!("{} is outside the repository", path),
        }
    }

    fn scheduler(&self) -> Scheduler {
        let engine = &self.config.engine;
        let mut s = Scheduler::new(Duration::from_secs_f64(engine.heartbeat), engine.lost_after());
        // Remote queues plug in here; every backend runs jobs locally for now.
        for (name, limits) in &self.config.backends {
            s.add_backend(
                name,
                Box::new(LocalBackend::default()),
                ResourcePool::new(name, limits.clone()),
            );
        }
        s
    }

    fn caches(&self) -> BTreeMap<String, Box<dyn Cache>> {
        self.config
            .caches
            .iter()
            .map(|(name, c)| {
                let cache: Box<dyn Cache> = Box::new(DirCache::new(self.root.abs(&c.dir), &c.repo, c.size));
                (name.clone(), cache)
            })
            .collect()
    }

    /// The job that produces `name`: the recorded one, else the one the
    /// rules would pick.
    fn producer(&self, store: &mut Store, name: &str) -> anyhow::Result<Option<JobId>> {
        if let Some(id) = store.graph.node_id(name) {
            if let Some(job) = store.graph.node(id).producer {
                return Ok(Some(job));
            }
        }
        let Some(m) = self.rules.matches(name)?.into_iter().next() else {
            return Ok(None);
        };
        let rule = &self.rules.rule(m.rule).name;
        Ok(Some(store.get_or_create_job(rule, &m.job_name, &m.stems)))
    }
}

fn build(mut repo: Repo, cwd: &Path, args: BuildArgs) -> anyhow::Result<i32> {
    if let Some(n) = args.jobs {
        repo.config.set_parallelism(n);
    }
    let log = args.log_file.then(|| repo.root.admin_dir().join("log"));
    logging::init(log.as_deref())?;
    if args.goals.is_empty() {
        bail!("no goal given");
    }
    let goals = args
        .goals
        .iter()
        .map(|g| repo.node_name(cwd, g))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut store = Store::open(repo.root.clone())?;
    let lib = repo
        .config
        .engine
        .autodep_lib
        .as_ref()
        .map(|p| repo.root.abs(p).display().to_string());
    let lib = autodep::ld::find_library(lib.as_deref());
    signal::register_sigint();
    let mut progress = ConsoleProgress::default();
    let ok = Engine::new(
        &mut store,
        &repo.rules,
        &repo.config.engine,
        repo.scheduler(),
        &mut progress,
    )
    .with_caches(repo.caches(), args.cache_mode)
    .with_autodep_lib(lib)
    .build(&goals)?;
    Ok(if ok { 0 } else { 1 })
}

fn status(repo: &Repo, cwd: &Path, args: StatusArgs) -> anyhow::Result<i32> {
    logging::init(None)?;
    let mut store = Store::open(repo.root.clone())?;
    let mut all_ok = true;
    for goal in &args.goals {
        let name = repo.node_name(cwd, goal)?;
        let Some(job) = repo.producer(&mut store, &name)? else {
            println!("source {}", name);
            continue;
        };
        let ok = store.is_up_to_date(&repo.rules, job, repo.config.engine.max_dep_depth)?;
        all_ok &= ok;
        println!("{} {}", if ok { "ok" } else { "stale" }, name);
        if args.explain {
            explain(repo, &store, job);
        }
    }
    Ok(if all_ok { 0 } else { 1 })
}

/// Print the inputs of a job's digest, as the rules see it now.
fn explain(repo: &Repo, store: &Store, job: JobId) {
    let j = store.graph.job(job);
    let inst = repo
        .rules
        .rematch(&j.rule, &j.stems)
        .and_then(|m| Some((m.rule, repo.rules.instantiate(&m).ok()?)));
    let Some((rule, inst)) = inst else {
        println!("  rule {} no longer applies", j.rule);
        return;
    };
    let mut h = ExplainHash::default();
    repo.rules
        .rule(rule)
        .hash_inputs(&mut h, &j.name, &inst.cmd, &inst.resolved);
    if let Some(recorded) = j.rule_digest {
        let deps: Vec<_> = j
            .deps
            .iter()
            .map(|d| (store.graph.node(d.node).name.clone(), d.digest))
            .collect();
        crate::hash::hash_deps(&mut h, &recorded, &deps);
    }
    for line in h.lines {
        println!("  {}", line);
    }
}

fn forget(repo: &Repo, cwd: &Path, args: ForgetArgs) -> anyhow::Result<i32> {
    logging::init(None)?;
    let mut store = Store::open(repo.root.clone())?;
    for t in &args.targets {
        let name = repo.node_name(cwd, t)?;
        match repo.producer(&mut store, &name)? {
            Some(job) => store.forget(job)?,
            None => bail!("no job produces {}", name),
        }
    }
    Ok(0)
}

fn freeze(repo: &Repo, cwd: &Path, args: FreezeArgs) -> anyhow::Result<i32> {
    logging::init(None)?;
    let mut store = Store::open(repo.root.clone())?;
    for p in &args.paths {
        let name = repo.node_name(cwd, p)?;
        let id = store.get_or_create_node(&name);
        store.freeze(id, !args.off)?;
    }
    Ok(0)
}

fn open_repo() -> anyhow::Result<(Repo, PathBuf)> {
    let cwd = std::env::current_dir()?;
    let repo = Repo::open(&cwd)?;
    Ok((repo, cwd))
}

pub fn run() -> anyhow::Result<i32> {
    let argv: Vec<String> = std::env::args().collect();
    let Some((prog, rest)) = argv.split_first() else {
        bail!("empty argv");
    };
    let rest = with_default_command(rest.to_vec());
    let rest: Vec<&str> = rest.iter().map(String::as_str).collect();
    let args = match Args::from_args(&[prog.as_str()], &rest) {
        Ok(args) => args,
        Err(early) => {
            return match early.status {
                Ok(()) => {
                    println!("{}", early.output);
                    Ok(0)
                }
                Err(()) => {
                    eprintln!("{}", early.output);
                    Ok(2)
                }
            };
        }
    };

    if let Some(dir) = &args.chdir {
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    match args.cmd {
        Command::Build(a) => {
            let (repo, cwd) = open_repo()?;
            build(repo, &cwd, a)
        }
        Command::Status(a) => {
            let (repo, cwd) = open_repo()?;
            status(&repo, &cwd, a)
        }
        Command::Forget(a) => {
            let (repo, cwd) = open_repo()?;
            forget(&repo, &cwd, a)
        }
        Command::Freeze(a) => {
            let (repo, cwd) = open_repo()?;
            freeze(&repo, &cwd, a)
        }
        Command::Depend(a) => {
            JobClient::from_env()?.declare_deps(&a.paths, &a.flags)?;
            Ok(0)
        }
        Command::Target(a) => {
            JobClient::from_env()?.declare_targets(&a.paths, &a.flags)?;
            Ok(0)
        }
        Command::CheckDeps(_) => {
            JobClient::from_env()?.check_deps()?;
            Ok(0)
        }
        Command::Encode(a) => {
            let code = JobClient::from_env()?.encode(&a.file, &a.ctx, &a.value, a.min_len)?;
            println!("{}", code);
            Ok(0)
        }
        Command::Decode(a) => {
            let value = JobClient::from_env()?.decode(&a.file, &a.ctx, &a.code)?;
            println!("{}", value);
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn build_is_the_default() {
        assert_eq!(with_default_command(v(&["out"])), v(&["build", "out"]));
        assert_eq!(with_default_command(v(&["-C", "d", "out"])), v(&["-C", "d", "build", "out"]));
        assert_eq!(with_default_command(v(&["status", "out"])), v(&["status", "out"]));
        assert_eq!(with_default_command(v(&["-C", "d"])), v(&["-C", "d", "build"]));
        assert_eq!(with_default_command(v(&["--help"])), v(&["--help"]));
    }

    #[test]
    fn parses_subcommands() {
        let args = Args::from_args(&["dynmake"], &["build", "-j", "3", "--cache-mode", "none", "a"]).unwrap();
        match args.cmd {
            Command::Build(b) => {
                assert_eq!(b.jobs, Some(3));
                assert_eq!(b.cache_mode, CacheMode::None);
                assert_eq!(b.goals, vec!["a".to_string()]);
            }
            _ => panic!("expected build"),
        }
        let args = Args::from_args(&["dynmake"], &["depend", "--flag", "critical", "x"]).unwrap();
        assert!(matches!(args.cmd, Command::Depend(DependArgs { ref flags, .. }) if flags == &["critical"]));
    }
}
