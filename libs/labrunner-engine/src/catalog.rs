/// Module Catalog
///
/// Read-only view of the exercise tree:
///
/// ```text
/// <modules_path>/
///   module-1/
///     module.json
///     lab/README.md
///     exercise/            <- resolve_exercise_path("module-1")
///       package.json
///       test.js
/// ```
///
/// File names inside `module.json` are joined through `safe_join`, so a
/// manifest cannot point outside its module directory.
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::error;

const MANIFEST: &str = "module.json";
const EXERCISE_DIR: &str = "exercise";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleFiles {
    pub lab: ModuleFile,
    pub exercise: ModuleFile,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Module {
    pub id: String,
    pub title: String,
    pub description: String,
    pub difficulty: String,
    pub estimated_time: String,
    pub tags: Vec<String>,
    pub files: ModuleFiles,
    pub learning_objectives: Vec<String>,
    pub prerequisites: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorFiles {
    pub server: String,
    pub test: String,
    pub package: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseContent {
    pub readme: String,
    pub editor_files: EditorFiles,
    pub solution: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleContent {
    pub module: Module,
    pub lab_content: String,
    pub exercise_content: ExerciseContent,
}

#[derive(Debug, Clone)]
pub struct ModuleCatalog {
    modules_path: PathBuf,
}

impl ModuleCatalog {
    pub fn new(modules_path: impl Into<PathBuf>) -> Self {
        Self {
            modules_path: modules_path.into(),
        }
    }

    pub fn modules_path(&self) -> &Path {
        &self.modules_path
    }

    /// On-disk root of a module's exercise, if it exists.
    pub fn resolve_exercise_path(&self, module_id: &str) -> Option<PathBuf> {
        let module_dir = safe_join(&self.modules_path, module_id).ok()?;
        let exercise = module_dir.join(EXERCISE_DIR);
        exercise.is_dir().then_some(exercise)
    }

    /// Every readable module, ordered by its numeric suffix.
    pub fn list_modules(&self) -> Result<Vec<Module>> {
        let entries = fs::read_dir(&self.modules_path).with_context(|| {
            format!("Failed to read modules directory {}", self.modules_path.display())
        })?;

        let mut names = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with("module-"))
            .collect::<Vec<_>>();
        names.sort_by(|a, b| compare_module_names(a, b));

        let mut modules = Vec::with_capacity(names.len());
        for name in names {
            match self.load_manifest(&name) {
                Ok(module) => modules.push(module),
                Err(e) => error!(module = %name, error = %e, "Error loading module"),
            }
        }

        Ok(modules)
    }

    pub fn get_module(&self, module_id: &str) -> Result<Module> {
        self.list_modules()?
            .into_iter()
            .find(|module| module.id == module_id)
            .with_context(|| format!("module {} not found", module_id))
    }

    /// Module manifest plus the text of every file it names.
    pub fn module_content(&self, module_id: &str) -> Result<ModuleContent> {
        let module = self.get_module(module_id)?;
        let module_dir = safe_join(&self.modules_path, module_id)?;

        let read = |name: &Option<String>| -> String {
            name.as_deref()
                .and_then(|rel| safe_join(&module_dir, rel).ok())
                .and_then(|path| fs::read_to_string(path).ok())
                .unwrap_or_default()
        };

        let lab_content = read(&module.files.lab.readme);
        let exercise = &module.files.exercise;
        let exercise_content = ExerciseContent {
            readme: read(&exercise.readme),
            editor_files: EditorFiles {
                server: read(&exercise.server),
                test: read(&exercise.test),
                package: read(&exercise.package),
            },
            solution: read(&exercise.solution),
        };

        Ok(ModuleContent {
            module,
            lab_content,
            exercise_content,
        })
    }

    fn load_manifest(&self, name: &str) -> Result<Module> {
        let path = self.modules_path.join(name).join(MANIFEST);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// Join `relative` onto `base`, refusing anything that would leave `base`.
pub fn safe_join(base: &Path, relative: &str) -> Result<PathBuf> {
    let mut joined = base.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!("path traversal detected: {}", relative)
            }
        }
    }
    if joined == base {
        bail!("empty path: {:?}", relative);
    }
    Ok(joined)
}

fn module_number(name: &str) -> Option<u64> {
    name.strip_prefix("module-")?.parse().ok()
}

fn compare_module_names(a: &str, b: &str) -> Ordering {
    match (module_number(a), module_number(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}
