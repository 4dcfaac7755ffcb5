use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use torque_dso::{Dso, decompile_to_string};

/// Decompile Torque DSO files back to script source.
#[derive(Debug, Parser)]
#[command(name = "torque-dso", version, about)]
struct Args {
    /// DSO files, or directories to scan recursively for `.cs.dso` files.
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Dump the decompiled script to standard output instead of files.
    #[arg(long)]
    stdout: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut failed = false;
    for path in &args.paths {
        if !path.exists() {
            error!(path = %path.display(), "no such file or directory");
            failed = true;
            continue;
        }
        for file in collect_files(path) {
            if let Err(err) = process_file(&file, args.stdout) {
                error!(file = %file.display(), %err, "decompilation failed");
                failed = true;
            }
        }
    }
    if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

fn collect_files(path: &Path) -> Vec<PathBuf> {
    if path.is_dir() {
        WalkDir::new(path)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .filter(|file| file.to_string_lossy().ends_with(".cs.dso"))
            .collect()
    } else {
        vec![path.to_path_buf()]
    }
}

fn process_file(path: &Path, to_stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut source = path.to_path_buf();
    if !to_stdout {
        // Keep a pristine copy, and decompile from it on later runs so we
        // never feed our own output back in.
        let backup = suffixed(path, ".bak");
        if backup.exists() {
            source = backup;
        } else {
            fs::copy(path, &backup)?;
        }
    }

    let data = fs::read(&source)?;
    let dso = Dso::new(&data)?;
    let script = decompile_to_string(&dso)?;

    if to_stdout {
        print!("{script}");
    } else {
        let out_path = output_path(path);
        if let Err(err) = fs::write(&out_path, &script) {
            // Do not leave a half-written script behind.
            let _ = fs::remove_file(&out_path);
            return Err(err.into());
        }
        info!(file = %source.display(), output = %out_path.display(), "decompiled");
    }
    Ok(())
}

/// `foo.cs.dso` becomes `foo.cs` next to it; anything else gets `.cs` appended.
fn output_path(path: &Path) -> PathBuf {
    let name = path.to_string_lossy();
    match name.strip_suffix(".dso") {
        Some(stem) if stem.ends_with(".cs") => PathBuf::from(stem),
        _ => suffixed(path, ".cs"),
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{suffix}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_names() {
        assert_eq!(
            output_path(Path::new("scripts/main.cs.dso")),
            PathBuf::from("scripts/main.cs")
        );
        assert_eq!(
            output_path(Path::new("scripts/odd.dso")),
            PathBuf::from("scripts/odd.dso.cs")
        );
        assert_eq!(
            output_path(Path::new("plain")),
            PathBuf::from("plain.cs")
        );
    }
}
