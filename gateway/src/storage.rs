use std::{
    fmt,
    fs::{self, File},
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Tasks,
    Applications,
    Infrastructures,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Tasks => "tasks",
            ResourceKind::Applications => "applications",
            ResourceKind::Infrastructures => "infrastructures",
        };
        f.write_str(s)
    }
}

/// Contrato de almacenamiento de archivos que usa el core.
pub trait Storage: Send + Sync {
    /// Ruta local de caché del recurso (se crea si no existe).
    fn cache_path(&self, kind: ResourceKind, id: &str, subfolder: Option<&str>)
        -> io::Result<PathBuf>;

    fn store_file(
        &self,
        kind: ResourceKind,
        id: &str,
        data: &mut dyn Read,
        name: &str,
        subfolder: Option<&str>,
    ) -> io::Result<PathBuf>;

    fn remove_all_files(&self, kind: ResourceKind, id: &str) -> io::Result<()>;
}

/// Storage sobre el filesystem local: `<base>/<kind>/<id>[/<subfolder>]`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base: PathBuf,
}

impl LocalStorage {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }
}

/// Rechaza nombres que se escapen del directorio del recurso.
pub fn check_component(name: &str) -> io::Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\');
    if bad {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("nombre de archivo inválido: {name:?}"),
        ));
    }
    Ok(())
}

impl Storage for LocalStorage {
    fn cache_path(
        &self,
        kind: ResourceKind,
        id: &str,
        subfolder: Option<&str>,
    ) -> io::Result<PathBuf> {
        check_component(id)?;
        let mut path = self.base.join(kind.to_string()).join(id);
        if let Some(sub) = subfolder {
            check_component(sub)?;
            path = path.join(sub);
        }
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    fn store_file(
        &self,
        kind: ResourceKind,
        id: &str,
        data: &mut dyn Read,
        name: &str,
        subfolder: Option<&str>,
    ) -> io::Result<PathBuf> {
        check_component(name)?;
        let dir = self.cache_path(kind, id, subfolder)?;
        let path = dir.join(name);

        let mut writer = BufWriter::new(File::create(&path)?);
        io::copy(data, &mut writer)?;
        writer.flush()?;

        Ok(path)
    }

    fn remove_all_files(&self, kind: ResourceKind, id: &str) -> io::Result<()> {
        check_component(id)?;
        let path = self.base.join(kind.to_string()).join(id);
        match fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
