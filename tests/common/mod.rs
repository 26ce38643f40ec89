use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use mcphub::mcp::config::{EndpointDefinition, ProcessParams};
use mcphub::mcp::types::Implementation;

/// Path to the `mcp_test_server` binary built alongside the tests.
#[allow(dead_code)]
pub fn test_server_exe() -> PathBuf {
    if let Ok(p) = std::env::var("CARGO_BIN_EXE_mcp_test_server") {
        return PathBuf::from(p);
    }
    if let Ok(manifest) = std::env::var("CARGO_MANIFEST_DIR") {
        let debug = PathBuf::from(manifest)
            .join("target")
            .join("debug")
            .join("mcp_test_server");
        if debug.exists() {
            return debug;
        }
    }
    PathBuf::from("mcp_test_server")
}

/// Process parameters running the helper server with `args`.
#[allow(dead_code)]
pub fn helper_params(args: &[&str]) -> ProcessParams {
    ProcessParams {
        command: test_server_exe().to_string_lossy().into_owned(),
        args: args.iter().map(|a| a.to_string()).collect(),
        env: Default::default(),
        cwd: None,
    }
}

/// An endpoint definition running the helper server as `--prefix id`.
#[allow(dead_code)]
pub fn helper_endpoint(id: &str, extra: &[&str]) -> EndpointDefinition {
    let mut args = vec!["--prefix", id];
    args.extend_from_slice(extra);
    EndpointDefinition::process(id, test_server_exe().to_string_lossy(), args)
        .with_timeout(Duration::from_secs(5))
}

#[allow(dead_code)]
pub fn client_info() -> Implementation {
    Implementation {
        name: "mcphub-tests".to_string(),
        version: "0.0.0".to_string(),
        description: None,
    }
}

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("mcphub.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}
