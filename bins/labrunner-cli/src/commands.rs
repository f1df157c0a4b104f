// Command implementations for the labrunner CLI

use anyhow::{bail, Context, Result};
use labrunner_common::config::{EngineConfig, SandboxConfig};
use labrunner_engine::build_context;
use labrunner_engine::sandbox::{RunMode, SandboxManager};
use labrunner_engine::{Executor, ModuleCatalog};
use std::fs;
use std::path::{Path, PathBuf};

fn read_submission(file: &Path) -> Result<String> {
    let code = fs::read_to_string(file)
        .with_context(|| format!("Failed to read submission {}", file.display()))?;
    if code.trim().is_empty() {
        bail!("Submission {} is empty", file.display());
    }
    Ok(code)
}

fn exercise_dir(engine: &EngineConfig, module_id: &str) -> Result<PathBuf> {
    ModuleCatalog::new(engine.modules_path.clone())
        .resolve_exercise_path(module_id)
        .with_context(|| {
            format!(
                "Module '{}' not found under {}",
                module_id,
                engine.modules_path.display()
            )
        })
}

async fn executor(engine: EngineConfig, mut sandbox: SandboxConfig, no_docker: bool) -> Executor {
    if no_docker {
        sandbox.enabled = false;
    }
    Executor::initialize(sandbox, engine).await
}

pub async fn run_submission(
    engine: EngineConfig,
    sandbox: SandboxConfig,
    module_id: &str,
    file: &Path,
    no_docker: bool,
) -> Result<()> {
    let code = read_submission(file)?;
    let executor = executor(engine, sandbox, no_docker).await;
    eprintln!("🚀 Running {} via {} strategy", module_id, executor.strategy_name());

    let result = executor.run_code(module_id, &code).await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.success {
        eprintln!("✅ {} ({} ms)", result.message, result.execution_time_ms);
    } else {
        eprintln!("❌ {}", result.message);
    }
    Ok(())
}

pub async fn test_submission(
    engine: EngineConfig,
    sandbox: SandboxConfig,
    module_id: &str,
    file: &Path,
    no_docker: bool,
) -> Result<()> {
    let code = read_submission(file)?;
    let executor = executor(engine, sandbox, no_docker).await;
    eprintln!("🧪 Testing {} via {} strategy", module_id, executor.strategy_name());

    let suite = executor.run_tests(module_id, &code).await;
    println!("{}", serde_json::to_string_pretty(&suite)?);

    eprintln!(
        "\n📊 {}/{} passed, {} failed ({} ms)",
        suite.passed_tests, suite.total_tests, suite.failed_tests, suite.execution_time_ms
    );
    for result in suite.results.iter().filter(|r| !r.passed) {
        eprintln!("  ❌ {}", result.name);
    }
    Ok(())
}

/// Write the deterministic build archive for `module_id` to `output`.
pub fn write_context(engine: &EngineConfig, module_id: &str, output: &Path) -> Result<()> {
    let exercise = exercise_dir(engine, module_id)?;
    let context = build_context::assemble(&exercise, &engine.recipe_path)
        .with_context(|| format!("Failed to assemble build context for {}", module_id))?;

    fs::write(output, &context.archive)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("📦 Build context for {}:", module_id);
    for entry in &context.entries {
        println!("  {}", entry);
    }
    println!(
        "\n✅ Wrote {} entries ({} bytes) to {}",
        context.entries.len(),
        context.archive.len(),
        output.display()
    );
    Ok(())
}

pub async fn build_image(
    engine: EngineConfig,
    sandbox: SandboxConfig,
    module_id: &str,
    test: bool,
) -> Result<()> {
    let exercise = exercise_dir(&engine, module_id)?;
    let manager = SandboxManager::connect(sandbox, &engine)
        .await
        .context("Failed to connect to Docker")?;

    let mode = if test { RunMode::Test } else { RunMode::Run };
    let tag = SandboxManager::image_tag(module_id, mode);

    println!("🔨 Building {}...", tag);
    manager
        .build_image(&exercise, &tag)
        .await
        .with_context(|| format!("Failed to build {}", tag))?;
    println!("✅ Image {} ready", tag);
    Ok(())
}

pub fn list_modules(engine: &EngineConfig) -> Result<()> {
    let modules = ModuleCatalog::new(engine.modules_path.clone()).list_modules()?;

    if modules.is_empty() {
        println!("No modules found under {}.", engine.modules_path.display());
        return Ok(());
    }

    println!("📋 Modules:\n");
    println!("{:<12} {:<40} {:<14} {:<10}", "ID", "TITLE", "DIFFICULTY", "TYPE");
    println!("{}", "─".repeat(80));
    for module in &modules {
        let kind = if engine.is_function_module(&module.id) {
            "function"
        } else {
            "server"
        };
        println!(
            "{:<12} {:<40} {:<14} {:<10}",
            module.id, module.title, module.difficulty, kind
        );
    }
    println!("\n✅ Total: {} module(s)", modules.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine_with_module(root: &Path) -> EngineConfig {
        let exercise = root.join("modules/module-2/exercise");
        fs::create_dir_all(&exercise).unwrap();
        fs::write(exercise.join("package.json"), "{}").unwrap();
        fs::write(exercise.join("test.js"), "describe()").unwrap();
        let recipe = root.join("Dockerfile.module-runner");
        fs::write(&recipe, "FROM node:20-alpine\n").unwrap();

        EngineConfig {
            modules_path: root.join("modules"),
            recipe_path: recipe,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_write_context() {
        let root = TempDir::new().unwrap();
        let engine = engine_with_module(root.path());
        let output = root.path().join("out.tar");

        write_context(&engine, "module-2", &output).unwrap();

        let written = fs::read(&output).unwrap();
        let expected = build_context::assemble(
            &root.path().join("modules/module-2/exercise"),
            &engine.recipe_path,
        )
        .unwrap();
        assert_eq!(written, expected.archive);
    }

    #[test]
    fn test_write_context_unknown_module() {
        let root = TempDir::new().unwrap();
        let engine = engine_with_module(root.path());
        let err = write_context(&engine, "module-9", &root.path().join("x.tar")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_empty_submission_rejected() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("empty.js");
        fs::write(&file, "   \n").unwrap();
        assert!(read_submission(&file).is_err());
    }
}
