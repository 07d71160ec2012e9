use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

use super::{DirHandle, RemoteFs};

/// Implementación sobre el filesystem de esta máquina (URLs `file://`).
/// Sirve cuando el "remoto" es un filesystem compartido montado localmente.
#[derive(Debug, Clone, Default)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        Self
    }
}

fn local_path(url: &Url) -> Result<PathBuf> {
    if url.scheme() != "file" {
        bail!(
            "LocalFs sólo soporta URLs file:// (recibió esquema '{}' en {})",
            url.scheme(),
            url
        );
    }
    match url.host_str() {
        None | Some("") | Some("localhost") => {}
        Some(host) => bail!("LocalFs no puede acceder al host remoto '{}'", host),
    }
    url.to_file_path()
        .map_err(|_| anyhow!("path inválido en {}", url))
}

// Si el destino es un directorio, el archivo conserva su nombre
async fn resolve_target(target: &Url, source: &Path) -> Result<PathBuf> {
    let path = local_path(target)?;
    let is_dir = target.path().ends_with('/')
        || tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);

    if !is_dir {
        return Ok(path);
    }
    let name = source
        .file_name()
        .ok_or_else(|| anyhow!("el origen {} no tiene nombre de archivo", source.display()))?;
    Ok(path.join(name))
}

#[async_trait]
impl RemoteFs for LocalFs {
    async fn create_dir(&self, url: &Url, recursive: bool) -> Result<()> {
        let path = local_path(url)?;
        debug!("creando directorio {}", path.display());
        let res = if recursive {
            tokio::fs::create_dir_all(&path).await
        } else {
            tokio::fs::create_dir(&path).await
        };
        res.with_context(|| format!("no se pudo crear el directorio {}", url))
    }

    async fn open_dir(&self, url: &Url) -> Result<Box<dyn DirHandle>> {
        let path = local_path(url)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("no se pudo abrir el directorio {}", url))?;
        if !meta.is_dir() {
            bail!("{} no es un directorio", url);
        }
        Ok(Box::new(LocalDir {
            url: url.clone(),
            closed: false,
        }))
    }
}

pub struct LocalDir {
    url: Url,
    closed: bool,
}

impl LocalDir {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            bail!("el directorio {} ya fue cerrado", self.url);
        }
        Ok(())
    }
}

#[async_trait]
impl DirHandle for LocalDir {
    fn url(&self) -> &Url {
        &self.url
    }

    async fn copy(&mut self, source: &Url, target: &Url) -> Result<()> {
        self.ensure_open()?;
        let src = local_path(source)?;
        let dst = resolve_target(target, &src).await?;
        tokio::fs::copy(&src, &dst)
            .await
            .with_context(|| format!("falló la copia de {} a {}", source, target))?;
        Ok(())
    }

    async fn link(&mut self, source: &Url, target: &Url) -> Result<()> {
        self.ensure_open()?;
        let src = local_path(source)?;
        let dst = resolve_target(target, &src).await?;
        symlink(&src, &dst)
            .await
            .with_context(|| format!("falló el enlace de {} a {}", source, target))
    }

    async fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.closed = true;
        Ok(())
    }
}

#[cfg(unix)]
async fn symlink(src: &Path, dst: &Path) -> Result<()> {
    tokio::fs::symlink(src, dst).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn symlink(_src: &Path, _dst: &Path) -> Result<()> {
    bail!("los enlaces simbólicos sólo están soportados en unix")
}
