/// Build Context Assembler
///
/// Packs an exercise directory plus the shared build recipe into a tar archive
/// for the container engine's build endpoint.
///
/// **Determinism:**
/// The same directory contents always produce the same bytes, so the engine's
/// layer cache keeps working across requests:
/// - entries are visited in sorted order, depth first
/// - every header carries mode 0644, mtime 0, uid/gid 0
/// - paths are relative to the exercise root and `/`-separated
///
/// **Exclusions (per file, never fatal):**
/// - files above `MAX_CONTEXT_FILE_BYTES`
/// - the submission staging file, OS metadata, `.log` / `.tmp` files
/// - anything that is not a regular file (symlinks, sockets)
use crate::error::ExecutionError;
use crate::ENTRY_POINT;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const MAX_CONTEXT_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Name the build recipe is stored under, whatever its source path.
pub const RECIPE_NAME: &str = "Dockerfile";

const SKIPPED_NAMES: &[&str] = &[ENTRY_POINT, ".DS_Store"];
const SKIPPED_EXTENSIONS: &[&str] = &["log", "tmp"];

#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Raw tar bytes
    pub archive: Vec<u8>,
    /// Archive entry names in write order, recipe last
    pub entries: Vec<String>,
}

/// Assemble the build context for `exercise_dir` with the recipe at `recipe_path`.
pub fn assemble(exercise_dir: &Path, recipe_path: &Path) -> Result<BuildContext, ExecutionError> {
    if !exercise_dir.is_dir() {
        return Err(ExecutionError::ContextAssembly(format!(
            "exercise directory {} does not exist",
            exercise_dir.display()
        )));
    }

    let recipe = fs::read(recipe_path).map_err(|e| {
        ExecutionError::ContextAssembly(format!(
            "failed to read build recipe {}: {}",
            recipe_path.display(),
            e
        ))
    })?;

    let mut files = Vec::new();
    collect_files(exercise_dir, exercise_dir, &mut files)?;

    let mut builder = tar::Builder::new(Vec::new());
    let mut entries = Vec::with_capacity(files.len() + 1);

    for (relative, absolute) in files {
        let content = fs::read(&absolute)?;
        append_entry(&mut builder, &relative, &content)?;
        entries.push(relative);
    }

    append_entry(&mut builder, RECIPE_NAME, &recipe)?;
    entries.push(RECIPE_NAME.to_string());

    let archive = builder.into_inner()?;
    debug!(
        exercise = %exercise_dir.display(),
        entries = entries.len(),
        bytes = archive.len(),
        "Assembled build context"
    );

    Ok(BuildContext { archive, entries })
}

/// Single-file archive used to drop the submission into a container.
pub fn single_file_archive(name: &str, content: &[u8]) -> Result<Vec<u8>, ExecutionError> {
    let mut builder = tar::Builder::new(Vec::new());
    append_entry(&mut builder, name, content)?;
    Ok(builder.into_inner()?)
}

fn append_entry(
    builder: &mut tar::Builder<Vec<u8>>,
    name: &str,
    content: &[u8],
) -> Result<(), ExecutionError> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    builder.append_data(&mut header, name, content)?;
    Ok(())
}

fn collect_files(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(String, PathBuf)>,
) -> Result<(), ExecutionError> {
    let mut children = fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    children.sort_by_key(|entry| entry.file_name());

    for child in children {
        let path = child.path();
        let file_type = child.file_type()?;

        if file_type.is_dir() {
            collect_files(root, &path, out)?;
            continue;
        }
        if !file_type.is_file() {
            debug!(path = %path.display(), "Skipping non-regular file");
            continue;
        }

        let relative = relative_name(root, &path)?;
        if is_transient(&path) || relative == RECIPE_NAME {
            debug!(path = %path.display(), "Skipping transient file");
            continue;
        }

        let size = child.metadata()?.len();
        if size > MAX_CONTEXT_FILE_BYTES {
            warn!(path = %path.display(), size, "Skipping large file");
            continue;
        }

        out.push((relative, path));
    }

    Ok(())
}

fn is_transient(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if SKIPPED_NAMES.contains(&name) {
        return true;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SKIPPED_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

fn relative_name(root: &Path, path: &Path) -> Result<String, ExecutionError> {
    let relative = path.strip_prefix(root).map_err(|_| {
        ExecutionError::ContextAssembly(format!("{} escapes the exercise root", path.display()))
    })?;
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    Ok(parts.join("/"))
}
