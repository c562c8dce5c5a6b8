use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

/// Compose the evaluator environment for `entrypoint` from layered `.env`
/// files. The process environment is never consulted: the map starts empty,
/// `rootDir/.env` merges first, and the entrypoint directory's `.env` merges
/// over it when that directory is not the root. Static entrypoints
/// (`index.html`) get an empty map — file serving needs no env.
pub fn compose(root_dir: &Path, entrypoint: &Path) -> Result<HashMap<String, String>> {
    let mut env = HashMap::new();

    if entrypoint.file_name().is_some_and(|n| n == "index.html") {
        return Ok(env);
    }

    merge(&mut env, &root_dir.join(".env"))?;

    if let Some(dir) = entrypoint.parent() {
        if dir != root_dir {
            merge(&mut env, &dir.join(".env"))?;
        }
    }

    Ok(env)
}

/// Merge `path` into `env`, later keys overwriting. A missing file is not an
/// error; a malformed one is.
fn merge(env: &mut HashMap<String, String>, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    for item in dotenvy::from_path_iter(path)
        .with_context(|| format!("Failed to read {}", path.display()))?
    {
        let (key, value) =
            item.with_context(|| format!("Failed to parse {}", path.display()))?;
        env.insert(key, value);
    }

    Ok(())
}
