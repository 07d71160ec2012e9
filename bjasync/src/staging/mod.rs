//! Workers de staging: mueven los datos de entrada hacia el directorio remoto
//! de cada tarea y los de salida de vuelta.

pub mod input;
pub mod output;

use anyhow::{anyhow, Context, Result};
use std::{
    env,
    path::{Path, PathBuf},
};
use url::Url;

pub use input::InputStager;
pub use output::OutputStager;

/// Path local del que llama:
/// - `.` es el directorio actual
/// - relativo: se resuelve contra el directorio actual
/// - absoluto: tal cual
fn resolve_local_path(raw: &str) -> Result<PathBuf> {
    let path = Path::new(raw);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = env::current_dir().context("no se pudo obtener el directorio actual")?;
    if raw == "." {
        return Ok(cwd);
    }
    Ok(cwd.join(path))
}

/// URL `file://` de un archivo local.
pub(crate) fn local_file_url(raw: &str) -> Result<Url> {
    let path = resolve_local_path(raw)?;
    Url::from_file_path(&path).map_err(|_| anyhow!("path local inválido: {}", path.display()))
}

/// URL `file://` de un destino local. `.` y los paths que terminan en `/`
/// son directorios: el archivo copiado conserva su nombre.
pub(crate) fn local_target_url(raw: &str) -> Result<Url> {
    let path = resolve_local_path(raw)?;
    let as_dir = raw == "." || raw.ends_with('/');
    let url = if as_dir {
        Url::from_directory_path(&path)
    } else {
        Url::from_file_path(&path)
    };
    url.map_err(|_| anyhow!("path local inválido: {}", path.display()))
}
