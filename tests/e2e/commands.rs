use crate::e2e::*;

fn hello_world() -> anyhow::Result<TestSpace> {
    let space = TestSpace::new()?;
    space.rules(&rules(&[CAT_RULE]))?;
    space.write("hello", "hello\n")?;
    space.write("world", "world\n")?;
    Ok(space)
}

#[test]
fn status_follows_sources() -> anyhow::Result<()> {
    let space = hello_world()?;
    space.run_expect(&mut dynmake_command(vec!["hello+world"]))?;

    let out = space.run_expect(&mut dynmake_command(vec!["status", "hello+world", "hello"]))?;
    assert_output_contains(&out, "ok hello+world\n");
    assert_output_contains(&out, "source hello\n");

    space.rewrite("hello", "bonjour\n")?;
    let out = space.run_fail(&mut dynmake_command(vec!["status", "--explain", "hello+world"]))?;
    assert_output_contains(&out, "stale hello+world\n");
    assert_output_contains(&out, "  ");
    Ok(())
}

#[test]
fn forget_forces_a_rerun() -> anyhow::Result<()> {
    let space = hello_world()?;
    space.run_expect(&mut dynmake_command(vec!["hello+world"]))?;
    space.run_expect(&mut dynmake_command(vec!["forget", "hello+world"]))?;
    let out = space.run_expect(&mut dynmake_command(vec!["hello+world"]))?;
    assert_output_contains(&out, "done hello+world\n");
    assert_output_not_contains(&out, "new hello");
    Ok(())
}

#[test]
fn frozen_target_is_not_rebuilt() -> anyhow::Result<()> {
    let space = hello_world()?;
    space.run_expect(&mut dynmake_command(vec!["hello+world"]))?;
    space.run_expect(&mut dynmake_command(vec!["freeze", "hello+world"]))?;
    space.rewrite("hello", "bonjour\n")?;
    let out = space.run_expect(&mut dynmake_command(vec!["hello+world"]))?;
    assert_output_not_contains(&out, "done");
    assert_eq!(space.read("hello+world")?, b"hello\nworld\n");

    space.run_expect(&mut dynmake_command(vec!["freeze", "--off", "hello+world"]))?;
    let out = space.run_expect(&mut dynmake_command(vec!["hello+world"]))?;
    assert_output_contains(&out, "done hello+world\n");
    assert_eq!(space.read("hello+world")?, b"bonjour\nworld\n");
    Ok(())
}

#[test]
fn declared_dep_from_a_job() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let bin = dynmake_binary();
    space.rules(&rules(&[&format!(
        r#"{{"name": "dyn", "targets": {{"out": "dyn"}},
            "cmd": "{} depend hello && cat hello > {{out}}",
            "attrs": {{"autodep": "none"}}}}"#,
        bin.display()
    )]))?;
    space.write("hello", "hello\n")?;
    let out = space.run_expect(&mut dynmake_command(vec!["dyn"]))?;
    assert_output_contains(&out, "new hello\n");
    assert_output_contains(&out, "done dyn\n");

    let out = space.run_expect(&mut dynmake_command(vec!["dyn"]))?;
    assert_output_not_contains(&out, "done");

    space.rewrite("hello", "bonjour\n")?;
    let out = space.run_expect(&mut dynmake_command(vec!["dyn"]))?;
    assert_output_contains(&out, "changed hello\n");
    assert_output_contains(&out, "done dyn\n");
    assert_eq!(space.read("dyn")?, b"bonjour\n");
    Ok(())
}

#[test]
fn encode_from_a_job() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let bin = dynmake_binary();
    space.rules(&rules(&[&format!(
        r#"{{"name": "enc", "targets": {{"out": "code"}},
            "cmd": "{} encode --file codes --ctx c hello > {{out}}",
            "attrs": {{"autodep": "none"}}}}"#,
        bin.display()
    )]))?;
    space.run_expect(&mut dynmake_command(vec!["code"]))?;
    let code = String::from_utf8(space.read("code")?)?;
    let code = code.trim();
    assert!(code.len() >= 4);
    let table = String::from_utf8(space.read("codes")?)?;
    assert_eq!(table, format!("c\t{}\thello\n", code));
    Ok(())
}

#[test]
fn job_commands_need_a_job() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out = space.run(dynmake_command(vec!["depend", "x"]).env_remove("DYNMAKE_CONTROL"))?;
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("not running inside a job"));
    assert!(out.stdout.is_empty());
    Ok(())
}

#[test]
fn job_told_of_a_dep_error_fails_despite_exit_0() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let bin = dynmake_binary();
    space.rules(&rules(&[
        r#"{"name": "bad", "targets": {"out": "bad"}, "cmd": "exit 1",
            "attrs": {"autodep": "none"}}"#,
        &format!(
            r#"{{"name": "reader", "targets": {{"out": "reader"}},
                "cmd": "{} depend bad || true; echo ok > {{out}}",
                "attrs": {{"autodep": "none"}}}}"#,
            bin.display()
        ),
    ]))?;
    let out = space.run_fail(&mut dynmake_command(vec!["reader"]))?;
    assert_output_contains(&out, "failed bad\n");
    assert_output_contains(&out, "was_dep_err reader\n");
    assert_output_contains(&out, "read a dep in error\n");
    assert_output_not_contains(&out, "done reader");

    // Nothing was recorded as good: the next run tries again.
    let out = space.run_fail(&mut dynmake_command(vec!["reader"]))?;
    assert_output_not_contains(&out, "done reader");
    assert_output_not_contains(&out, "steady reader");
    Ok(())
}
