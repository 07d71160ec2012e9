//! Primitiva de filesystem remoto: crear/abrir directorios, copiar y enlazar,
//! todo direccionado por URL.

pub mod local;

use anyhow::Result;
use async_trait::async_trait;
use url::Url;

pub use local::LocalFs;

#[async_trait]
pub trait RemoteFs: Send + Sync {
    async fn create_dir(&self, url: &Url, recursive: bool) -> Result<()>;

    async fn open_dir(&self, url: &Url) -> Result<Box<dyn DirHandle>>;
}

/// Handle sobre un directorio abierto.
///
/// En `copy`/`link`, si `target` termina en `/` o es un directorio existente,
/// el archivo conserva su nombre dentro de ese directorio.
#[async_trait]
pub trait DirHandle: Send {
    fn url(&self) -> &Url;

    async fn copy(&mut self, source: &Url, target: &Url) -> Result<()>;

    async fn link(&mut self, source: &Url, target: &Url) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Une un path a una URL base.
/// - path absoluto: reemplaza el path de la URL tal cual
/// - path relativo: se cuelga del path base (que se trata como directorio)
pub fn join_path(base: &Url, rel: &str) -> Url {
    let mut url = base.clone();
    if rel.starts_with('/') {
        url.set_path(rel);
        return url;
    }

    let mut path = base.path().to_string();
    if !path.ends_with('/') {
        path.push('/');
    }
    let rel = rel.trim_start_matches("./");
    if rel != "." {
        path.push_str(rel);
    }
    url.set_path(&path);
    url
}
