// Rejects lint-suppression attributes ("#[" + "allow" + ...) in eventrelay sources.
// Set CHECK_NO_ALLOW=0 to skip the scan.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const SCANNED: [&str; 2] = ["src", "tests"];
const IGNORED_DIRS: [&str; 3] = ["target", ".git", "vendor"];

fn main() {
    for relative in SCANNED {
        println!("cargo:rerun-if-changed={relative}");
    }
    println!("cargo:rerun-if-env-changed=CHECK_NO_ALLOW");

    if env::var("CHECK_NO_ALLOW").is_ok_and(|v| v == "0") {
        return;
    }

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("manifest dir"));

    let mut violations = Vec::new();
    for relative in SCANNED {
        let path = manifest_dir.join(relative);
        if path.exists() {
            scan(&path, &mut violations);
        }
    }

    if violations.is_empty() {
        return;
    }

    eprintln!("ERROR: lint suppression attributes found in eventrelay:");
    for (file, line, content) in &violations {
        eprintln!("  {}:{}: {}", file.display(), line, content.trim());
    }
    panic!("{} lint suppression attribute(s) found", violations.len());
}

fn scan(path: &Path, violations: &mut Vec<(PathBuf, usize, String)>) {
    if path.is_dir() {
        if IGNORED_DIRS.iter().any(|d| path.ends_with(d)) {
            return;
        }
        for entry in fs::read_dir(path).expect("read dir") {
            scan(&entry.expect("dir entry").path(), violations);
        }
        return;
    }

    if path.extension().is_none_or(|ext| ext != "rs") {
        return;
    }

    let Ok(content) = fs::read_to_string(path) else {
        return;
    };
    for (idx, line) in content.lines().enumerate() {
        if line.contains("#[allow") || line.contains("#![allow") {
            violations.push((path.to_path_buf(), idx + 1, line.to_string()));
        }
    }
}
