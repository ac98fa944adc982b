//! Archive access used by the merge engine.

use anyhow::{anyhow, bail, Context, Result};
use filetime::{set_file_mtime, FileTime};
use std::{
    fs, io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};
use time::{Date, Month, PrimitiveDateTime, Time as TimeOfDay};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveOptions {
    /// Open for writing. The file need not exist yet.
    pub create: bool,
}

pub trait ArchiveService: Send + Sync {
    fn supports(&self, path: &Path) -> bool;
    fn open(&self, path: &Path, options: &ArchiveOptions) -> Result<Box<dyn ArchiveHandle>>;
}

pub trait ArchiveHandle {
    fn extract_all(&self, dest: &Path) -> Result<()>;
    /// Packs the contents of `source_dir` into the archive, replacing it.
    fn create(&self, source_dir: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    SevenZip,
}

impl ArchiveKind {
    fn of(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
        match ext.as_str() {
            "zip" | "pak" | "pk3" | "pk4" => Some(ArchiveKind::Zip),
            "7z" => Some(ArchiveKind::SevenZip),
            _ => None,
        }
    }
}

/// Zip archives (read and write) and 7z archives (read only).
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultArchives;

impl ArchiveService for DefaultArchives {
    fn supports(&self, path: &Path) -> bool {
        ArchiveKind::of(path).is_some()
    }

    fn open(&self, path: &Path, options: &ArchiveOptions) -> Result<Box<dyn ArchiveHandle>> {
        let kind = ArchiveKind::of(path)
            .ok_or_else(|| anyhow!("unsupported archive type: {}", path.display()))?;
        if !options.create && !path.is_file() {
            bail!("archive not found: {}", path.display());
        }
        Ok(Box::new(FileArchive {
            path: path.to_path_buf(),
            kind,
        }))
    }
}

struct FileArchive {
    path: PathBuf,
    kind: ArchiveKind,
}

impl ArchiveHandle for FileArchive {
    fn extract_all(&self, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest).context("create extract dir")?;
        match self.kind {
            ArchiveKind::Zip => extract_zip(&self.path, dest),
            ArchiveKind::SevenZip => extract_7z(&self.path, dest),
        }
    }

    fn create(&self, source_dir: &Path) -> Result<()> {
        match self.kind {
            ArchiveKind::Zip => create_zip(source_dir, &self.path),
            ArchiveKind::SevenZip => bail!(
                "writing 7z archives is not supported: {}",
                self.path.display()
            ),
        }
    }
}

fn extract_zip(path: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(path).context("open zip")?;
    let mut archive = zip::ZipArchive::new(file).context("read zip")?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).context("zip entry")?;
        let Some(out_path) = file.enclosed_name() else {
            continue;
        };

        let out_path = dest.join(out_path);
        if file.is_dir() {
            fs::create_dir_all(&out_path).context("create zip dir")?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).context("create zip dir")?;
        }

        let mut out_file = fs::File::create(&out_path).context("write zip entry")?;
        io::copy(&mut file, &mut out_file).context("extract zip entry")?;
        if let Some(dt) = file.last_modified() {
            if let Some(mtime) = zip_time_to_unix(dt) {
                let _ = set_file_mtime(&out_path, FileTime::from_unix_time(mtime, 0));
            }
        }
    }

    Ok(())
}

fn zip_time_to_unix(dt: zip::DateTime) -> Option<i64> {
    let month = Month::try_from(dt.month()).ok()?;
    let date = Date::from_calendar_date(dt.year() as i32, month, dt.day()).ok()?;
    let time = TimeOfDay::from_hms(dt.hour(), dt.minute(), dt.second()).ok()?;
    Some(PrimitiveDateTime::new(date, time).assume_utc().unix_timestamp())
}

fn create_zip(source_dir: &Path, archive_path: &Path) -> Result<()> {
    if let Some(parent) = archive_path.parent() {
        fs::create_dir_all(parent).context("create archive dir")?;
    }
    let temp = archive_path.with_extension("zip.tmp");
    let file = fs::File::create(&temp).context("create zip")?;
    let mut writer = zip::ZipWriter::new(file);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let mut entries: Vec<PathBuf> = WalkDir::new(source_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    entries.sort();

    for path in entries {
        let rel = path.strip_prefix(source_dir).context("rel path")?;
        let name = rel.to_string_lossy().replace('\\', "/");
        writer
            .start_file(name, options)
            .context("start zip entry")?;
        let mut input = fs::File::open(&path).context("open archive input")?;
        io::copy(&mut input, &mut writer).context("write zip entry")?;
    }
    writer.finish().context("finish zip")?;
    fs::rename(&temp, archive_path).context("replace archive")?;
    Ok(())
}

fn extract_7z(path: &Path, dest: &Path) -> Result<()> {
    match extract_with_7z(path, dest) {
        Ok(Some(())) => Ok(()),
        Ok(None) => sevenz_rust::decompress_file(path, dest)
            .with_context(|| format!("extract 7z archive {path:?}")),
        Err(err) => Err(err),
    }
}

/// Prefers an installed `7z` binary. `None` when it is not on PATH.
fn extract_with_7z(path: &Path, dest: &Path) -> Result<Option<()>> {
    let output = Command::new("7z")
        .arg("x")
        .arg("-y")
        .arg(format!("-o{}", dest.display()))
        .arg(path)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output();

    let output = match output {
        Ok(output) => output,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).context("launch 7z"),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("7z extraction failed: {}", stderr.trim());
    }
    Ok(Some(()))
}
