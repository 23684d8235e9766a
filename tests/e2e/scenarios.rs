use crate::e2e::*;

fn hello_world() -> anyhow::Result<TestSpace> {
    let space = TestSpace::new()?;
    space.rules(&rules(&[CAT_RULE]))?;
    space.write("hello", "hello\n")?;
    space.write("world", "world\n")?;
    Ok(space)
}

#[test]
fn build_then_nothing_to_do() -> anyhow::Result<()> {
    let space = hello_world()?;
    let out = space.run_expect(&mut dynmake_command(vec!["hello+world"]))?;
    assert_output_contains(&out, "new hello\n");
    assert_output_contains(&out, "new world\n");
    assert_output_contains(&out, "done hello+world\n");
    assert_eq!(summary(&out), "ok: new=2 done=1");
    assert_eq!(space.read("hello+world")?, b"hello\nworld\n");

    let out = space.run_expect(&mut dynmake_command(vec!["build", "hello+world"]))?;
    assert_output_not_contains(&out, "done");
    assert_eq!(summary(&out), "ok:");
    Ok(())
}

#[test]
fn changed_source_reruns_only_its_users() -> anyhow::Result<()> {
    let space = hello_world()?;
    let out = space.run_expect(&mut dynmake_command(vec!["hello+world", "world+world"]))?;
    assert_eq!(summary(&out), "ok: new=2 done=2");

    space.rewrite("hello", "bonjour\n")?;
    let out = space.run_expect(&mut dynmake_command(vec!["hello+world"]))?;
    assert_output_contains(&out, "changed hello\n");
    assert_eq!(summary(&out), "ok: changed=1 done=1");
    assert_eq!(space.read("hello+world")?, b"bonjour\nworld\n");

    let out = space.run_expect(&mut dynmake_command(vec!["world+world"]))?;
    assert_eq!(summary(&out), "ok:");
    Ok(())
}

#[test]
fn failure_propagates_as_dep_error() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.rules(&rules(&[
        r#"{"name": "bad", "targets": {"out": "bad"}, "cmd": "echo oops >&2; exit 1",
            "attrs": {"autodep": "none"}}"#,
        r#"{"name": "use_bad", "targets": {"out": "use_bad"}, "deps": {"b": "bad"},
            "cmd": "cp {b} {out}", "attrs": {"autodep": "none"}}"#,
    ]))?;
    let out = space.run_fail(&mut dynmake_command(vec!["use_bad"]))?;
    assert_output_contains(&out, "failed bad\n");
    assert_output_contains(&out, "  oops\n");
    assert_output_contains(&out, "dep_err use_bad\n");
    assert_eq!(summary(&out), "failed: failed=1 dep_err=1");
    assert!(!space.exists("use_bad"));
    Ok(())
}

#[test]
fn missing_goal() -> anyhow::Result<()> {
    let space = hello_world()?;
    let out = space.run_fail(&mut dynmake_command(vec!["nowhere"]))?;
    assert!(summary(&out).starts_with("failed:"));
    Ok(())
}

#[test]
fn goal_in_subdir_relative_to_cwd() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.rules(&rules(&[
        r#"{"name": "copy", "stems": {"D": ".*"}, "targets": {"out": "{D}/copy"},
            "deps": {"src": "{D}/src"}, "cmd": "cp {src} {out}",
            "attrs": {"autodep": "none"}}"#,
    ]))?;
    space.write("sub/src", "x")?;
    let out = space.run_expect(&mut dynmake_command(vec!["-C", "sub", "copy"]))?;
    assert_output_contains(&out, "done sub/copy\n");
    assert_eq!(space.read("sub/copy")?, b"x");
    Ok(())
}

#[test]
fn interrupt_kills_running_jobs_before_exiting() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.rules(&rules(&[
        r#"{"name": "slow", "targets": {"out": "slow"},
            "cmd": "echo $$ > pid; trap '' TERM INT; sleep 30; echo x > {out}",
            "attrs": {"autodep": "none"}}"#,
    ]))?;
    let child = dynmake_command(vec!["slow"])
        .current_dir(space.path())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;
    let start = std::time::Instant::now();
    while !space.exists("pid") {
        assert!(start.elapsed() < std::time::Duration::from_secs(10));
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    // Let the job install its trap.
    std::thread::sleep(std::time::Duration::from_millis(300));
    let pid: libc::pid_t = String::from_utf8(space.read("pid")?)?.trim().parse()?;
    // Safety: plain kill(2) on our own child.
    unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGINT) };
    let out = child.wait_with_output()?;
    assert!(!out.status.success());
    assert_output_contains(&out, "killed slow\n");

    // The job ignores TERM: dynmake must have stayed around to send KILL.
    let start = std::time::Instant::now();
    // Safety: signal 0 only checks for existence.
    while unsafe { libc::kill(pid, 0) } == 0 {
        assert!(
            start.elapsed() < std::time::Duration::from_secs(2),
            "job outlived dynmake"
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    assert!(!space.exists("slow"));
    Ok(())
}
