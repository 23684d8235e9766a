use crate::e2e::*;

const CACHED_CAT: &str = r#"
    {"name": "cat", "stems": {"A": "[^+/]+", "B": "[^+/]+"},
     "targets": {"out": "{A}+{B}"}, "deps": {"a": "{A}", "b": "{B}"},
     "cmd": "cat {a} {b} > {out}", "attrs": {"autodep": "none", "cache": "shared"}}
"#;

fn cached_space() -> anyhow::Result<TestSpace> {
    let space = TestSpace::new()?;
    space.write("dynmake.toml", "[caches.shared]\ndir = \"cache\"\n")?;
    space.rules(&rules(&[CACHED_CAT]))?;
    space.write("hello", "hello\n")?;
    space.write("world", "world\n")?;
    Ok(space)
}

#[test]
fn forgotten_job_comes_back_from_cache() -> anyhow::Result<()> {
    let space = cached_space()?;
    let out = space.run_expect(&mut dynmake_command(vec!["hello+world"]))?;
    assert_output_contains(&out, "done hello+world\n");

    space.run_expect(&mut dynmake_command(vec!["forget", "hello+world"]))?;
    std::fs::remove_file(space.path().join("hello+world"))?;
    let out = space.run_expect(&mut dynmake_command(vec!["hello+world"]))?;
    assert_output_contains(&out, "hit hello+world\n");
    assert_output_not_contains(&out, "done hello+world");
    assert_eq!(space.read("hello+world")?, b"hello\nworld\n");
    Ok(())
}

#[test]
fn cache_mode_none_skips_the_cache() -> anyhow::Result<()> {
    let space = cached_space()?;
    space.run_expect(&mut dynmake_command(vec!["hello+world"]))?;
    space.run_expect(&mut dynmake_command(vec!["forget", "hello+world"]))?;
    let out = space.run_expect(&mut dynmake_command(vec![
        "build",
        "--cache-mode",
        "none",
        "hello+world",
    ]))?;
    assert_output_contains(&out, "done hello+world\n");
    Ok(())
}

#[test]
fn changed_dep_misses() -> anyhow::Result<()> {
    let space = cached_space()?;
    space.run_expect(&mut dynmake_command(vec!["hello+world"]))?;
    space.rewrite("hello", "bonjour\n")?;
    let out = space.run_expect(&mut dynmake_command(vec!["hello+world"]))?;
    assert_output_contains(&out, "done hello+world\n");
    assert_eq!(space.read("hello+world")?, b"bonjour\nworld\n");
    Ok(())
}

#[test]
fn clones_at_different_paths_share_results() -> anyhow::Result<()> {
    let cache = tempfile::tempdir()?;
    let clone = || -> anyhow::Result<TestSpace> {
        let space = TestSpace::new()?;
        space.write(
            "dynmake.toml",
            &format!("[caches.shared]\ndir = \"{}\"\n", cache.path().display()),
        )?;
        space.rules(&rules(&[CACHED_CAT]))?;
        space.write("hello", "hello\n")?;
        space.write("world", "world\n")?;
        Ok(space)
    };
    let a = clone()?;
    let b = clone()?;
    assert_ne!(a.path(), b.path());

    let out = a.run_expect(&mut dynmake_command(vec!["hello+world"]))?;
    assert_output_contains(&out, "done hello+world\n");
    let out = b.run_expect(&mut dynmake_command(vec!["hello+world"]))?;
    assert_output_contains(&out, "hit hello+world\n");
    assert_output_not_contains(&out, "done hello+world");
    assert_eq!(b.read("hello+world")?, b"hello\nworld\n");
    Ok(())
}
