//! Support code for e2e tests, which run dynmake as a binary.

mod autodep;
mod cache;
mod commands;
mod scenarios;
mod targets;

pub fn dynmake_binary() -> std::path::PathBuf {
    std::env::current_exe()
        .expect("test binary path")
        .parent()
        .expect("test binary directory")
        .parent()
        .expect("binary directory")
        .join("dynmake")
}

pub fn dynmake_command(args: Vec<&str>) -> std::process::Command {
    let mut cmd = std::process::Command::new(dynmake_binary());
    cmd.args(args);
    // Keep the report lines free of log noise.
    cmd.env_remove("DYNMAKE_LOG");
    cmd
}

fn print_output(out: &std::process::Output) {
    // Gross: use print! instead of writing to stdout so Rust test
    // framework can capture it.
    print!("{}", String::from_utf8_lossy(&out.stdout));
    print!("{}", String::from_utf8_lossy(&out.stderr));
}

pub fn assert_output_contains(out: &std::process::Output, text: &str) {
    let out = std::str::from_utf8(&out.stdout).unwrap();
    if !out.contains(text) {
        panic!(
            "assertion failed; expected output to contain {:?} but got:\n{}",
            text, out
        );
    }
}

pub fn assert_output_not_contains(out: &std::process::Output, text: &str) {
    let out = std::str::from_utf8(&out.stdout).unwrap();
    if out.contains(text) {
        panic!(
            "assertion failed; expected output to not contain {:?} but got:\n{}",
            text, out
        );
    }
}

/// The summary line ending a build's output.
pub fn summary(out: &std::process::Output) -> String {
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .last()
        .unwrap_or("")
        .to_string()
}

/// Manages a temporary directory for invoking dynmake.
pub struct TestSpace {
    dir: tempfile::TempDir,
}
impl TestSpace {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Ok(TestSpace { dir })
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Write a file into the working space.
    pub fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        let path = self.dir.path().join(path);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, content)
    }

    /// Rewrite a file and push its mtime forward, so that a change within
    /// the filesystem's timestamp granularity is still noticed.
    pub fn rewrite(&self, path: &str, content: &str) -> std::io::Result<()> {
        self.write(path, content)?;
        let later = filetime::FileTime::from_unix_time(
            filetime::FileTime::now().unix_seconds() + 10,
            0,
        );
        filetime::set_file_mtime(self.dir.path().join(path), later)
    }

    /// Read a file from the working space.
    pub fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.dir.path().join(path))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.dir.path().join(path).exists()
    }

    /// Write the rules file.
    pub fn rules(&self, json: &str) -> std::io::Result<()> {
        self.write("rules.json", json)
    }

    /// Invoke dynmake, returning process output.
    pub fn run(&self, cmd: &mut std::process::Command) -> std::io::Result<std::process::Output> {
        cmd.current_dir(self.dir.path()).output()
    }

    /// Like run, but also print output if the build failed.
    pub fn run_expect(
        &self,
        cmd: &mut std::process::Command,
    ) -> anyhow::Result<std::process::Output> {
        let out = self.run(cmd)?;
        if !out.status.success() {
            print_output(&out);
            anyhow::bail!("build failed, status {}", out.status);
        }
        Ok(out)
    }

    /// Like run, but expects the build to fail.
    pub fn run_fail(
        &self,
        cmd: &mut std::process::Command,
    ) -> anyhow::Result<std::process::Output> {
        let out = self.run(cmd)?;
        if out.status.success() {
            print_output(&out);
            anyhow::bail!("build unexpectedly succeeded");
        }
        Ok(out)
    }

    /// Persist the temp dir locally and abort the test.  Debugging helper.
    #[allow(dead_code)]
    pub fn eject(self) -> ! {
        panic!("ejected at {:?}", self.dir.into_path());
    }
}

/// Concatenates two sources named by the stems of the target.
pub const CAT_RULE: &str = r#"
    {"name": "cat", "stems": {"A": "[^+/]+", "B": "[^+/]+"},
     "targets": {"out": "{A}+{B}"}, "deps": {"a": "{A}", "b": "{B}"},
     "cmd": "cat {a} {b} > {out}", "attrs": {"autodep": "none"}}
"#;

/// A rules file from rule objects.
pub fn rules(rules: &[&str]) -> String {
    format!("{{\"rules\": [{}]}}", rules.join(","))
}
