//! Support for the interposition library (`autodep-ld`), loaded into the
//! job through the dynamic loader.

use super::Method;
use std::io::Read;
use std::path::{Path, PathBuf};

pub const LIB_NAME: &str = "libdynmake_autodep.so";

const PT_INTERP: u32 = 3;

pub fn env_var(method: Method) -> &'static str {
    match method {
        Method::LdAudit => "LD_AUDIT",
        _ => "LD_PRELOAD",
    }
}

/// The configured library, or the one installed next to our executable.
pub fn find_library(configured: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = configured {
        let path = PathBuf::from(path);
        return path.exists().then_some(path);
    }
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    [dir.join(LIB_NAME), dir.join("deps").join(LIB_NAME)]
        .into_iter()
        .find(|p| p.exists())
}

/// Resolve a program name through PATH, as exec would.
pub fn resolve_program(prog: &str) -> Option<PathBuf> {
    if prog.contains('/') {
        return Some(PathBuf::from(prog));
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(prog))
        .find(|p| p.is_file())
}

fn u16_at(b: &[u8], ofs: usize) -> Option<u16> {
    Some(u16::from_le_bytes(b.get(ofs..ofs + 2)?.try_into().ok()?))
}

fn u32_at(b: &[u8], ofs: usize) -> Option<u32> {
    Some(u32::from_le_bytes(b.get(ofs..ofs + 4)?.try_into().ok()?))
}

fn u64_at(b: &[u8], ofs: usize) -> Option<u64> {
    Some(u64::from_le_bytes(b.get(ofs..ofs + 8)?.try_into().ok()?))
}

/// Whether an ELF64 image requests a program interpreter, which is what
/// makes the loader, and thus the library, run.
fn has_interp(image: &[u8]) -> Option<bool> {
    if image.get(..4)? != b"\x7fELF" || *image.get(4)? != 2 {
        return None;
    }
    let phoff = u64_at(image, 0x20)? as usize;
    let phentsize = u16_at(image, 0x36)? as usize;
    let phnum = u16_at(image, 0x38)? as usize;
    for i in 0..phnum {
        if u32_at(image, phoff + i * phentsize)? == PT_INTERP {
            return Some(true);
        }
    }
    Some(false)
}

/// Whether the library will be loaded into `program`.  Scripts count as
/// dynamic: their interpreter is what runs.
pub fn is_dynamic(program: &Path) -> std::io::Result<bool> {
    let mut head = Vec::new();
    std::fs::File::open(program)?
        .take(64 * 1024)
        .read_to_end(&mut head)?;
    if !head.starts_with(b"\x7fELF") {
        return Ok(true);
    }
    Ok(has_interp(&head).unwrap_or(false))
}
