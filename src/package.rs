use std::fs::File;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info};

use crate::error::{DfuError, Result};
use crate::image::{FirmwareImage, InitDescriptor};

const DAT_NAME: &str = "application.dat";
const IMAGE_NAMES: [&str; 2] = ["application.hex", "application.bin"];

/// Image and init packet unpacked from a distribution archive.
///
/// The files live in a private temporary directory that is removed when
/// the bundle is dropped.
pub struct UpdateBundle {
    dir: TempDir,
    image: PathBuf,
    descriptor: PathBuf,
}

impl UpdateBundle {
    pub fn unpack(archive: &Path) -> Result<Self> {
        if !archive.is_file() {
            return Err(DfuError::InvalidInput(format!("{}: archive not found", archive.display())));
        }
        let stem = archive.file_stem().and_then(|s| s.to_str()).unwrap_or("dfu");
        let dir = tempfile::Builder::new().prefix(&format!("{}_", stem)).tempdir()?;
        debug!(dir = %dir.path().display(), "Unpacking archive");

        let reader = File::open(archive)?;
        let mut zip = zip::ZipArchive::new(reader).map_err(zip_err)?;
        zip.extract(dir.path()).map_err(zip_err)?;

        let (image_name, dat_name) = manifest_names(dir.path())?;
        let descriptor = dir.path().join(dat_name.as_deref().unwrap_or(DAT_NAME));
        if !descriptor.is_file() {
            return Err(DfuError::InvalidInput("no DAT file found in archive".into()));
        }
        let image = match image_name {
            Some(name) => Some(dir.path().join(name)),
            None => IMAGE_NAMES.iter().map(|name| dir.path().join(name)).find(|p| p.is_file()),
        }
        .filter(|p| p.is_file())
        .ok_or_else(|| DfuError::InvalidInput("no HEX or BIN file found in archive".into()))?;

        info!(image = %image.display(), descriptor = %descriptor.display(), "Unpacked archive");
        Ok(Self { dir, image, descriptor })
    }

    pub fn image_path(&self) -> &Path {
        &self.image
    }

    pub fn descriptor_path(&self) -> &Path {
        &self.descriptor
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

fn zip_err(e: zip::result::ZipError) -> DfuError {
    DfuError::InvalidInput(format!("archive: {}", e))
}

/// File names from `manifest.json`, when the archive carries one.
fn manifest_names(dir: &Path) -> Result<(Option<String>, Option<String>)> {
    let path = dir.join("manifest.json");
    if !path.is_file() {
        return Ok((None, None));
    }
    let manifest: serde_json::Value = serde_json::from_reader(File::open(&path)?)
        .map_err(|e| DfuError::InvalidInput(format!("manifest.json: {}", e)))?;

    let app = &manifest["manifest"]["application"];
    if !app.is_object() {
        return Err(DfuError::InvalidInput(
            "only application updates are supported".into(),
        ));
    }
    let bin_name = app["bin_file"].as_str().map(archive_member).transpose()?;
    let dat_name = app["dat_file"].as_str().map(archive_member).transpose()?;
    Ok((bin_name, dat_name))
}

/// A manifest entry must name a file at the top of the archive.
fn archive_member(name: &str) -> Result<String> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name.to_string()),
        _ => Err(DfuError::InvalidInput(format!(
            "manifest.json: {:?} is not a file in the archive",
            name
        ))),
    }
}

/// Where the image and init packet of an update come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateSource {
    Files { image: PathBuf, descriptor: PathBuf },
    Archive(PathBuf),
}

impl UpdateSource {
    /// An archive excludes explicit files; explicit files must come as a pair.
    pub fn from_args(image: Option<PathBuf>, descriptor: Option<PathBuf>, archive: Option<PathBuf>) -> Result<Self> {
        match (image, descriptor, archive) {
            (None, None, Some(archive)) => Ok(UpdateSource::Archive(archive)),
            (_, _, Some(_)) => Err(DfuError::InvalidInput("conflicting input directives".into())),
            (Some(image), Some(descriptor), None) => {
                if !image.is_file() {
                    return Err(DfuError::InvalidInput(format!("{}: image file doesn't exist", image.display())));
                }
                if !descriptor.is_file() {
                    return Err(DfuError::InvalidInput(format!(
                        "{}: DAT file doesn't exist",
                        descriptor.display()
                    )));
                }
                Ok(UpdateSource::Files { image, descriptor })
            }
            _ => Err(DfuError::InvalidInput(
                "an image and a DAT file, or an archive, are required".into(),
            )),
        }
    }

    /// Read the image and init packet fully into memory.
    pub fn load(&self) -> Result<(FirmwareImage, InitDescriptor)> {
        match self {
            UpdateSource::Files { image, descriptor } => {
                Ok((FirmwareImage::load(image)?, InitDescriptor::load(descriptor)?))
            }
            UpdateSource::Archive(archive) => {
                let bundle = UpdateBundle::unpack(archive)?;
                Ok((
                    FirmwareImage::load(bundle.image_path())?,
                    InitDescriptor::load(bundle.descriptor_path())?,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_zip(dir: &Path, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join(name);
        let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
        for (name, data) in files {
            zip.start_file(*name, zip::write::FileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
        path
    }

    #[test]
    fn test_unpack_conventional_names() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = make_zip(
            tmp.path(),
            "app.zip",
            &[("application.bin", &[1, 2, 3]), ("application.dat", &[9; 16])],
        );
        let bundle = UpdateBundle::unpack(&archive).unwrap();
        assert!(bundle.image_path().ends_with("application.bin"));
        assert!(bundle.descriptor_path().ends_with("application.dat"));
        assert!(bundle
            .dir()
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("app_"));
    }

    #[test]
    fn test_hex_preferred_over_bin() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = make_zip(
            tmp.path(),
            "app.zip",
            &[
                ("application.bin", &[1]),
                ("application.hex", b":00000001FF\n"),
                ("application.dat", &[9]),
            ],
        );
        let bundle = UpdateBundle::unpack(&archive).unwrap();
        assert!(bundle.image_path().ends_with("application.hex"));
    }

    #[test]
    fn test_missing_files_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let no_dat = make_zip(tmp.path(), "a.zip", &[("application.bin", &[1])]);
        assert!(matches!(UpdateBundle::unpack(&no_dat), Err(DfuError::InvalidInput(_))));

        let no_image = make_zip(tmp.path(), "b.zip", &[("application.dat", &[1])]);
        assert!(matches!(UpdateBundle::unpack(&no_image), Err(DfuError::InvalidInput(_))));

        assert!(matches!(
            UpdateBundle::unpack(&tmp.path().join("missing.zip")),
            Err(DfuError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_manifest_names() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = br#"{"manifest": {"application": {"bin_file": "blinky.bin", "dat_file": "blinky.dat"}}}"#;
        let archive = make_zip(
            tmp.path(),
            "blinky.zip",
            &[
                ("manifest.json", manifest),
                ("blinky.bin", &[1, 2]),
                ("blinky.dat", &[3]),
            ],
        );
        let bundle = UpdateBundle::unpack(&archive).unwrap();
        assert!(bundle.image_path().ends_with("blinky.bin"));
        assert!(bundle.descriptor_path().ends_with("blinky.dat"));
    }

    #[test]
    fn test_manifest_names_stay_inside_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tmp.path().join("outside.bin");
        std::fs::write(&outside, [0xde, 0xad]).unwrap();

        let names = [
            outside.to_str().unwrap().to_string(),
            "../outside.bin".to_string(),
            "fw/../../outside.bin".to_string(),
            "fw/app.bin".to_string(),
            "".to_string(),
        ];
        for (i, name) in names.iter().enumerate() {
            let manifest = serde_json::json!({
                "manifest": {"application": {"bin_file": name, "dat_file": "app.dat"}}
            })
            .to_string();
            let archive = make_zip(
                tmp.path(),
                &format!("evil{}.zip", i),
                &[("manifest.json", manifest.as_bytes()), ("app.dat", &[1])],
            );
            assert!(
                matches!(UpdateBundle::unpack(&archive), Err(DfuError::InvalidInput(_))),
                "{:?} accepted",
                name
            );
        }

        let manifest = br#"{"manifest": {"application": {"bin_file": "app.bin", "dat_file": "/etc/passwd"}}}"#;
        let archive = make_zip(
            tmp.path(),
            "evil_dat.zip",
            &[("manifest.json", manifest), ("app.bin", &[1])],
        );
        assert!(matches!(UpdateBundle::unpack(&archive), Err(DfuError::InvalidInput(_))));
    }

    #[test]
    fn test_manifest_without_application() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = br#"{"manifest": {"softdevice": {"bin_file": "sd.bin", "dat_file": "sd.dat"}}}"#;
        let archive = make_zip(tmp.path(), "sd.zip", &[("manifest.json", manifest)]);
        assert!(matches!(UpdateBundle::unpack(&archive), Err(DfuError::InvalidInput(_))));
    }

    #[test]
    fn test_bundle_cleanup_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = make_zip(
            tmp.path(),
            "app.zip",
            &[("application.bin", &[1, 2, 3]), ("application.dat", &[9; 16])],
        );
        let bundle = UpdateBundle::unpack(&archive).unwrap();
        let dir = bundle.dir().to_path_buf();
        assert!(dir.is_dir());
        drop(bundle);
        assert!(!dir.exists());
    }

    #[test]
    fn test_source_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("application.bin");
        let dat = tmp.path().join("application.dat");
        std::fs::write(&image, [1, 2, 3]).unwrap();
        std::fs::write(&dat, [4]).unwrap();
        let zip = PathBuf::from("app.zip");

        assert!(UpdateSource::from_args(Some(image.clone()), None, Some(zip.clone())).is_err());
        assert!(UpdateSource::from_args(None, Some(dat.clone()), Some(zip.clone())).is_err());
        assert!(UpdateSource::from_args(Some(image.clone()), None, None).is_err());
        assert!(UpdateSource::from_args(None, None, None).is_err());
        assert!(UpdateSource::from_args(Some(tmp.path().join("nope.bin")), Some(dat.clone()), None).is_err());
        assert_eq!(
            UpdateSource::from_args(None, None, Some(zip.clone())).unwrap(),
            UpdateSource::Archive(zip)
        );

        let source = UpdateSource::from_args(Some(image), Some(dat), None).unwrap();
        let (img, desc) = source.load().unwrap();
        assert_eq!(img.as_bytes(), [1, 2, 3]);
        assert_eq!(desc.as_bytes(), [4]);
    }

    #[test]
    fn test_load_from_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = make_zip(
            tmp.path(),
            "app.zip",
            &[("application.bin", &[5, 6, 7]), ("application.dat", &[8])],
        );
        let (img, desc) = UpdateSource::Archive(archive).load().unwrap();
        assert_eq!(img.as_bytes(), [5, 6, 7]);
        assert_eq!(desc.as_bytes(), [8]);
    }
}
