//! EuRoC-style session dataset for self-supervised training.
//!
//! A dataset root contains per-session subdirectories of monochrome images
//! whose filenames embed a zero-padded frame index. Construction walks the
//! tree once, keeps only directories that actually contain images, and
//! retains only frames whose full temporal context exists on disk. Sample
//! retrieval loads the frame, its context images, and (when configured and
//! present) a ground-truth depth map.
//!
//! Internal state is built once and read-only afterwards, so a dataset can be
//! shared across parallel fetch workers without locking.

pub mod npy;

use crate::camera::eucm::dummy_calibration;
use image::{DynamicImage, RgbImage};
use log::info;
use nalgebra::{DMatrix, Matrix3};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// File extensions recognized as dataset images, lowercase.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Sibling directory (two levels above a session) holding depth maps.
const DEPTH_DIR: &str = "depth_maps";

#[derive(thiserror::Error, Debug)]
pub enum DatasetError {
    #[error("IO Error: {0}")]
    IOError(String),
    #[error("Failed to decode image {path}: {reason}")]
    ImageDecode { path: PathBuf, reason: String },
    #[error("Depth type {0} not implemented")]
    UnsupportedDepthType(String),
    #[error("No frame index digits in filename: {0}")]
    MalformedFilename(String),
    #[error("Sample index {index} out of range for dataset of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Invalid .npy depth map {path}: {reason}")]
    Npy { path: PathBuf, reason: String },
}

impl From<std::io::Error> for DatasetError {
    fn from(err: std::io::Error) -> Self {
        DatasetError::IOError(err.to_string())
    }
}

/// Loader signature for one depth-map source.
pub type DepthLoaderFn = fn(&Path) -> Result<DMatrix<f32>, DatasetError>;

/// Dispatch table from depth-type tag to loader.
///
/// Depth sources are an extension point: registering a new tag is all that is
/// needed to support another depth exporter. The default registry knows the
/// vicon `.npy` maps.
pub struct DepthLoaderRegistry {
    loaders: HashMap<String, DepthLoaderFn>,
}

impl DepthLoaderRegistry {
    pub fn empty() -> Self {
        DepthLoaderRegistry {
            loaders: HashMap::new(),
        }
    }

    pub fn register(&mut self, depth_type: &str, loader: DepthLoaderFn) {
        self.loaders.insert(depth_type.to_string(), loader);
    }

    /// Resolves a tag, failing with the not-implemented condition for
    /// anything unregistered.
    pub fn get(&self, depth_type: &str) -> Result<DepthLoaderFn, DatasetError> {
        self.loaders
            .get(depth_type)
            .copied()
            .ok_or_else(|| DatasetError::UnsupportedDepthType(depth_type.to_string()))
    }
}

impl Default for DepthLoaderRegistry {
    fn default() -> Self {
        let mut registry = DepthLoaderRegistry::empty();
        registry.register("vicon", npy::read_f32_matrix);
        registry
    }
}

/// Transform applied to each sample as the final retrieval step.
pub type SampleTransform = Box<dyn Fn(Sample) -> Sample + Send + Sync>;

/// One training sample. Fields that depend on configuration (`rgb_context`)
/// or on-disk availability (`depth`) are optional; everything else is always
/// present.
pub struct Sample {
    pub idx: usize,
    /// Session path joined with the frame stem, unique across the dataset.
    pub filename: String,
    /// Grayscale source replicated to three channels.
    pub rgb: RgbImage,
    /// Placeholder calibration derived from image dimensions.
    pub intrinsics: Matrix3<f64>,
    pub intrinsic_type: String,
    /// Context images in offset order, present when context is configured.
    pub rgb_context: Option<Vec<RgbImage>>,
    /// Ground-truth depth, present when configured and the file exists.
    pub depth: Option<DMatrix<f32>>,
}

/// Dataset construction parameters.
pub struct DatasetConfig {
    pub root_dir: PathBuf,
    /// Zero-pad width of the frame index inside filenames.
    pub index_pad: usize,
    pub back_context: i64,
    pub forward_context: i64,
    /// Depth-type tag, resolved through the loader registry at access time.
    pub depth_type: Option<String>,
    /// Camera names; the first one tags the intrinsics.
    pub cameras: Vec<String>,
}

impl DatasetConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        DatasetConfig {
            root_dir: root_dir.into(),
            index_pad: 9,
            back_context: 0,
            forward_context: 0,
            depth_type: None,
            cameras: Vec::new(),
        }
    }
}

/// Extracts the frame index from the first run of digits in a filename.
pub fn frame_index(filename: &str) -> Result<i64, DatasetError> {
    let start = filename
        .find(|c: char| c.is_ascii_digit())
        .ok_or_else(|| DatasetError::MalformedFilename(filename.to_string()))?;
    let digits: &str = &filename[start..];
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end]
        .parse()
        .map_err(|_| DatasetError::MalformedFilename(filename.to_string()))
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

pub struct EurocDataset {
    config: DatasetConfig,
    /// Session directory → image filenames directly in it, discovery order.
    file_tree: Vec<(PathBuf, Vec<String>)>,
    /// Flat sample index: (position in `file_tree`, filename).
    files: Vec<(usize, String)>,
    depth_loaders: DepthLoaderRegistry,
    transform: Option<SampleTransform>,
}

impl EurocDataset {
    pub fn new(config: DatasetConfig) -> Result<Self, DatasetError> {
        Self::with_registry(config, DepthLoaderRegistry::default())
    }

    /// Builds the dataset with a caller-supplied depth loader table.
    pub fn with_registry(
        config: DatasetConfig,
        depth_loaders: DepthLoaderRegistry,
    ) -> Result<Self, DatasetError> {
        let mut file_tree = Vec::new();
        Self::read_files(&config.root_dir, &mut file_tree)?;

        let mut files = Vec::new();
        for (session_idx, (_, filenames)) in file_tree.iter().enumerate() {
            let file_set: HashSet<&str> = filenames.iter().map(String::as_str).collect();
            let mut sorted = filenames.clone();
            sorted.sort();
            for filename in sorted {
                if Self::has_context(&filename, &file_set, &config)? {
                    files.push((session_idx, filename));
                }
            }
        }

        info!(
            "EuRoC dataset at {:?}: {} sessions, {} samples with context",
            config.root_dir,
            file_tree.len(),
            files.len()
        );

        Ok(EurocDataset {
            config,
            file_tree,
            files,
            depth_loaders,
            transform: None,
        })
    }

    /// Installs a transform applied to every sample as the last step of
    /// [`EurocDataset::get`].
    pub fn with_transform(mut self, transform: SampleTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Recursively collects image filenames per directory. A directory with
    /// no images directly in it gets no entry; descendants are registered
    /// during recursion, deepest first.
    fn read_files(
        directory: &Path,
        tree: &mut Vec<(PathBuf, Vec<String>)>,
    ) -> Result<Vec<String>, DatasetError> {
        let mut entries: Vec<_> = fs::read_dir(directory)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.path();
            if path.is_dir() {
                let child_files = Self::read_files(&path, tree)?;
                if child_files.is_empty() {
                    continue;
                }
                tree.push((path, child_files));
            } else if is_image_file(&path) {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    files.push(name.to_string());
                }
            }
        }
        Ok(files)
    }

    /// Rebuilds a filename for a shifted frame index, keeping the extension.
    fn change_idx(idx: i64, filename: &str, pad: usize) -> String {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        format!("{idx:0pad$}{ext}")
    }

    /// Candidate context filenames at offsets `{-back, -forward, back,
    /// forward}` of the given frame. The four-entry offset list (with
    /// duplicates when back == forward) matches the stride handling of the
    /// recording pipeline and is load-bearing for which frames are admitted.
    fn context_file_names(
        filename: &str,
        config: &DatasetConfig,
    ) -> Result<Vec<String>, DatasetError> {
        let fidx = frame_index(filename)?;
        let offsets = [
            -config.back_context,
            -config.forward_context,
            config.back_context,
            config.forward_context,
        ];
        Ok(offsets
            .iter()
            .map(|off| Self::change_idx(fidx + off, filename, config.index_pad))
            .collect())
    }

    /// A frame has context iff every candidate neighbor exists in its session.
    fn has_context(
        filename: &str,
        file_set: &HashSet<&str>,
        config: &DatasetConfig,
    ) -> Result<bool, DatasetError> {
        let candidates = Self::context_file_names(filename, config)?;
        Ok(candidates.iter().all(|f| file_set.contains(f.as_str())))
    }

    fn read_rgb_file(&self, session: &Path, filename: &str) -> Result<RgbImage, DatasetError> {
        let path = session.join(filename);
        let gray = image::open(&path)
            .map_err(|e| DatasetError::ImageDecode {
                path: path.clone(),
                reason: e.to_string(),
            })?
            .to_luma8();
        // Monochrome source, replicated into the three RGB channels.
        Ok(DynamicImage::ImageLuma8(gray).to_rgb8())
    }

    fn read_rgb_context_files(
        &self,
        session_idx: usize,
        filename: &str,
    ) -> Result<Vec<RgbImage>, DatasetError> {
        let (session, filenames) = &self.file_tree[session_idx];
        let file_set: HashSet<&str> = filenames.iter().map(String::as_str).collect();
        let candidates = Self::context_file_names(filename, &self.config)?;
        candidates
            .iter()
            .filter(|f| file_set.contains(f.as_str()))
            .map(|f| self.read_rgb_file(session, f))
            .collect()
    }

    fn depth_file_path(&self, session: &Path, filename: &str) -> PathBuf {
        let stem = filename.split('.').next().unwrap_or(filename);
        session
            .join("..")
            .join("..")
            .join(DEPTH_DIR)
            .join(format!("{stem}depth.npy"))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Session directories and their image files, in discovery order.
    pub fn file_tree(&self) -> &[(PathBuf, Vec<String>)] {
        &self.file_tree
    }

    /// Whether any temporal context is configured.
    pub fn has_context_window(&self) -> bool {
        self.config.back_context + self.config.forward_context > 0
    }

    /// Retrieves one sample.
    ///
    /// Missing depth files are silent (the `depth` field stays `None`);
    /// an unregistered depth type fails with
    /// [`DatasetError::UnsupportedDepthType`] the first time a depth file is
    /// actually present.
    pub fn get(&self, idx: usize) -> Result<Sample, DatasetError> {
        let (session_idx, filename) =
            self.files
                .get(idx)
                .cloned()
                .ok_or(DatasetError::IndexOutOfRange {
                    index: idx,
                    len: self.files.len(),
                })?;
        let session = self.file_tree[session_idx].0.clone();

        let rgb = self.read_rgb_file(&session, &filename)?;
        let (width, height) = rgb.dimensions();

        let intrinsic_type = match self.config.cameras.first() {
            None => "euroc".to_string(),
            Some(camera) => format!("euroc_{camera}"),
        };

        let stem = filename.split('.').next().unwrap_or(&filename);
        let mut sample = Sample {
            idx,
            filename: format!("{}_{stem}", session.display()),
            rgb,
            intrinsics: dummy_calibration(width, height),
            intrinsic_type,
            rgb_context: None,
            depth: None,
        };

        if self.has_context_window() {
            sample.rgb_context = Some(self.read_rgb_context_files(session_idx, &filename)?);
        }

        if let Some(depth_type) = &self.config.depth_type {
            let depth_path = self.depth_file_path(&session, &filename);
            if depth_path.is_file() {
                let loader = self.depth_loaders.get(depth_type)?;
                sample.depth = Some(loader(&depth_path)?);
            }
        }

        if let Some(transform) = &self.transform {
            sample = transform(sample);
        }
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;
    use tempfile::TempDir;

    /// Builds `<root>/mav0/cam0/data` with zero-padded frames `range`, plus a
    /// `depth_maps` directory beside `cam0`.
    fn make_session(frames: std::ops::RangeInclusive<i64>) -> (TempDir, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let data_dir = root.path().join("mav0").join("cam0").join("data");
        fs::create_dir_all(&data_dir).unwrap();
        fs::create_dir_all(root.path().join("mav0").join(DEPTH_DIR)).unwrap();
        for i in frames {
            let img = GrayImage::from_pixel(8, 6, image::Luma([i as u8 * 10]));
            img.save(data_dir.join(format!("{i:09}.png"))).unwrap();
        }
        (root, data_dir)
    }

    fn context_config(root: &Path) -> DatasetConfig {
        let mut config = DatasetConfig::new(root);
        config.back_context = 1;
        config.forward_context = 1;
        config
    }

    #[test]
    fn test_frame_index_parses_first_digit_run() {
        assert_eq!(frame_index("000000123.png").unwrap(), 123);
        assert_eq!(frame_index("frame42_v2.png").unwrap(), 42);
        assert!(matches!(
            frame_index("no_digits.png"),
            Err(DatasetError::MalformedFilename(_))
        ));
    }

    #[test]
    fn test_boundary_frames_excluded() {
        let (root, _) = make_session(0..=10);
        let dataset = EurocDataset::new(context_config(root.path())).unwrap();

        // 0 and 10 have no neighbor on one side; 1..=9 survive.
        assert_eq!(dataset.len(), 9);
        for idx in 0..dataset.len() {
            let sample = dataset.get(idx).unwrap();
            let stem = sample.filename.rsplit('_').next().unwrap();
            let frame: i64 = stem.parse().unwrap();
            assert!((1..=9).contains(&frame));
        }
    }

    #[test]
    fn test_no_context_keeps_every_frame() {
        let (root, _) = make_session(0..=4);
        let dataset = EurocDataset::new(DatasetConfig::new(root.path())).unwrap();
        assert_eq!(dataset.len(), 5);
        let sample = dataset.get(0).unwrap();
        assert!(sample.rgb_context.is_none());
    }

    #[test]
    fn test_imageless_directories_pruned() {
        let (root, _) = make_session(0..=2);
        let empty = root.path().join("mav0").join("imu0");
        fs::create_dir_all(&empty).unwrap();
        fs::write(empty.join("data.csv"), "t,x,y,z\n").unwrap();

        let dataset = EurocDataset::new(DatasetConfig::new(root.path())).unwrap();
        assert!(dataset
            .file_tree()
            .iter()
            .all(|(path, _)| !path.ends_with("imu0")));
        assert_eq!(dataset.file_tree().len(), 1);
    }

    #[test]
    fn test_context_images_in_offset_order() {
        let (root, _) = make_session(0..=4);
        let dataset = EurocDataset::new(context_config(root.path())).unwrap();

        let sample = dataset.get(0).unwrap(); // frame 1
        let context = sample.rgb_context.unwrap();
        // Offsets [-1, -1, 1, 1]: both neighbors, duplicated.
        assert_eq!(context.len(), 4);
        assert_eq!(context[0].get_pixel(0, 0).0[0], 0); // frame 0
        assert_eq!(context[1].get_pixel(0, 0).0[0], 0);
        assert_eq!(context[2].get_pixel(0, 0).0[0], 20); // frame 2
        assert_eq!(context[3].get_pixel(0, 0).0[0], 20);
    }

    #[test]
    fn test_sample_fields() {
        let (root, _) = make_session(0..=2);
        let mut config = context_config(root.path());
        config.cameras = vec!["cam0".to_string()];
        let dataset = EurocDataset::new(config).unwrap();

        let sample = dataset.get(0).unwrap();
        assert_eq!(sample.intrinsic_type, "euroc_cam0");
        assert_eq!(sample.rgb.dimensions(), (8, 6));
        // Gray value 10 replicated into all three channels.
        let px = sample.rgb.get_pixel(0, 0).0;
        assert_eq!(px, [10, 10, 10]);
        // Dummy calibration from the 8x6 dimensions.
        assert_eq!(sample.intrinsics[(0, 0)], 1000.0);
        assert_eq!(sample.intrinsics[(0, 2)], 3.5);
        assert_eq!(sample.intrinsics[(1, 2)], 2.5);
        assert!(sample.filename.ends_with("_000000001"));
    }

    #[test]
    fn test_missing_depth_is_silent() {
        let (root, _) = make_session(0..=2);
        let mut config = context_config(root.path());
        config.depth_type = Some("vicon".to_string());
        let dataset = EurocDataset::new(config).unwrap();

        let sample = dataset.get(0).unwrap();
        assert!(sample.depth.is_none());
    }

    #[test]
    fn test_depth_attached_when_present() {
        let (root, data_dir) = make_session(0..=2);
        let depth_dir = data_dir.join("..").join("..").join(DEPTH_DIR);
        let depth = DMatrix::from_element(6, 8, 1.5f32);
        npy::write_f32_matrix(&depth_dir.join("000000001depth.npy"), &depth).unwrap();

        let mut config = context_config(root.path());
        config.depth_type = Some("vicon".to_string());
        let dataset = EurocDataset::new(config).unwrap();

        let sample = dataset.get(0).unwrap();
        let loaded = sample.depth.expect("depth file exists");
        assert_eq!(loaded.shape(), (6, 8));
        assert_eq!(loaded[(3, 4)], 1.5);
    }

    #[test]
    fn test_unsupported_depth_type_fails_at_use() {
        let (root, data_dir) = make_session(0..=2);
        let depth_dir = data_dir.join("..").join("..").join(DEPTH_DIR);
        let depth = DMatrix::from_element(6, 8, 1.0f32);
        npy::write_f32_matrix(&depth_dir.join("000000001depth.npy"), &depth).unwrap();

        let mut config = context_config(root.path());
        config.depth_type = Some("lidar".to_string());
        // Construction succeeds; the failure surfaces at first use.
        let dataset = EurocDataset::new(config).unwrap();

        assert!(matches!(
            dataset.get(0),
            Err(DatasetError::UnsupportedDepthType(tag)) if tag == "lidar"
        ));
    }

    #[test]
    fn test_index_out_of_range() {
        let (root, _) = make_session(0..=2);
        let dataset = EurocDataset::new(DatasetConfig::new(root.path())).unwrap();
        assert!(matches!(
            dataset.get(99),
            Err(DatasetError::IndexOutOfRange { index: 99, len: 3 })
        ));
    }

    #[test]
    fn test_sample_transform_runs_last() {
        let (root, _) = make_session(0..=2);
        let dataset = EurocDataset::new(DatasetConfig::new(root.path()))
            .unwrap()
            .with_transform(Box::new(|mut sample| {
                sample.intrinsic_type = "transformed".to_string();
                sample
            }));

        let sample = dataset.get(1).unwrap();
        assert_eq!(sample.intrinsic_type, "transformed");
    }
}
