//! Shader graph compiler CLI.
//!
//! Provides the `shadegraph` binary. `compile` runs a JSON list of shaders
//! through the same host update a renderer performs and prints the result;
//! `defaults` prints the default shaders in that input format.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::AtomicBool;

use clap::{Parser, Subcommand};

use shadegraph_core::Shader;
use shadegraph_manager::defaults::default_shaders;
use shadegraph_manager::{DeviceScene, ManagerConfig, ShaderManager, ShadingSystem};

/// Shader graph compiler and tools.
#[derive(Parser)]
#[command(name = "shadegraph", about = "Shader graph compiler and tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile shaders to bytecode.
    Compile {
        /// JSON file holding an array of shaders.
        #[arg(short, long)]
        input: PathBuf,

        /// JSON manager config (default: read from the environment).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print each shader's compile report instead of JSON.
        #[arg(long)]
        report: bool,

        /// Also print the uploaded instruction count.
        #[arg(long)]
        device: bool,
    },
    /// Print the default shaders as compile input.
    Defaults,
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Compile { input, config, report, device } => {
            run_compile(&input, config.as_deref(), report, device)
        }
        Commands::Defaults => run_defaults(),
    };
    process::exit(exit_code);
}

/// Execute the compile subcommand.
///
/// Returns exit code: 0 = success, 1 = some entry point failed,
/// 2 = invalid configuration, 3 = I/O or parse error.
fn run_compile(input: &Path, config_path: Option<&Path>, report: bool, device: bool) -> i32 {
    let config = match config_path {
        Some(path) => ManagerConfig::from_file(path),
        None => ManagerConfig::from_env(),
    };
    let config = match config {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 2;
        }
    };
    if config.shading_system != ShadingSystem::Svm {
        eprintln!("Error: the CLI compiles bytecode only; set the shading system to 'svm'");
        return 2;
    }

    let shaders = match read_shaders(input) {
        Ok(s) => s,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return 3;
        }
    };

    tracing::debug!(path = %input.display(), shaders = shaders.len(), "loaded shaders");

    let mut manager = match ShaderManager::new(config, None) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 2;
        }
    };
    for shader in shaders {
        manager.add_shader(shader);
    }

    let result = manager.host_update(&AtomicBool::new(false));
    if report {
        for (id, summary) in &result.summaries {
            let name = manager.shader(*id).map_or("", |s| s.name.as_str());
            println!("Shader {} ({}):\n{}", id, name, summary.full_report());
        }
    } else {
        let json = serde_json::to_string_pretty(&result)
            .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize result: {}\"}}", e));
        println!("{}", json);
    }

    if device {
        let mut scene = DeviceScene::new();
        manager.device_update(&mut scene);
        println!("Uploaded {} shaders, {} instructions", scene.shaders.len(), scene.svm_nodes.len());
    }

    for failure in &result.failures {
        eprintln!("  - shader {} {}: {}", failure.shader, failure.entry, failure.message);
    }
    if result.failures.is_empty() {
        0
    } else {
        1
    }
}

fn run_defaults() -> i32 {
    let shaders = match default_shaders() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    match serde_json::to_string_pretty(&shaders) {
        Ok(json) => {
            println!("{}", json);
            0
        }
        Err(e) => {
            eprintln!("Error: failed to serialize shaders: {}", e);
            3
        }
    }
}

fn read_shaders(path: &Path) -> Result<Vec<Shader>, String> {
    let text = fs::read_to_string(path).map_err(|e| format!("failed to read '{}': {}", path.display(), e))?;
    serde_json::from_str(&text).map_err(|e| format!("invalid shader list '{}': {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_defaults(dir: &Path) -> PathBuf {
        let path = dir.join("shaders.json");
        let shaders = default_shaders().unwrap();
        fs::write(&path, serde_json::to_string(&shaders).unwrap()).unwrap();
        path
    }

    #[test]
    fn default_shaders_compile_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_defaults(dir.path());
        let config = dir.path().join("config.json");
        fs::write(&config, r#"{ "shading_system": "svm" }"#).unwrap();
        assert_eq!(run_compile(&input, Some(&config), true, true), 0);
    }

    #[test]
    fn read_errors_use_their_own_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.json");
        fs::write(&config, "{}").unwrap();
        assert_eq!(run_compile(&dir.path().join("missing.json"), Some(&config), false, false), 3);

        let garbage = dir.path().join("garbage.json");
        fs::write(&garbage, "[{").unwrap();
        assert_eq!(run_compile(&garbage, Some(&config), false, false), 3);
    }

    #[test]
    fn osl_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_defaults(dir.path());
        let config = dir.path().join("config.json");
        fs::write(&config, r#"{ "shading_system": "osl" }"#).unwrap();
        assert_eq!(run_compile(&input, Some(&config), false, false), 2);
    }
}
