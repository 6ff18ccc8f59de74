//! C2 Template Store: recursive load of template images keyed by
//! path-relative name, with optional alpha-channel masks. Grounded on
//! `original_source/SLGrobot/vision/template_matcher.py`'s cache-and-walk
//! loader.

use opencv::core::{Mat, CV_8UC1};
use opencv::imgcodecs;
use opencv::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Template {
    pub name: String,
    pub image: Mat,
    pub mask: Option<Mat>,
}

/// Swapped atomically behind a `RwLock` on reload: readers that already hold
/// a clone of the `Arc<Inner>` keep seeing the old, complete cache (spec §5).
struct Inner {
    templates: HashMap<String, Template>,
}

pub struct TemplateStore {
    root: PathBuf,
    inner: RwLock<Arc<Inner>>,
}

impl TemplateStore {
    pub fn load(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let templates = Self::load_all(&root)?;
        Ok(Self {
            root,
            inner: RwLock::new(Arc::new(Inner { templates })),
        })
    }

    fn load_all(root: &Path) -> anyhow::Result<HashMap<String, Template>> {
        let mut out = HashMap::new();
        if !root.exists() {
            warn!("template root {} does not exist", root.display());
            return Ok(out);
        }
        Self::walk(root, root, &mut out)?;
        debug!("loaded {} templates from {}", out.len(), root.display());
        Ok(out)
    }

    fn walk(root: &Path, dir: &Path, out: &mut HashMap<String, Template>) -> anyhow::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::walk(root, &path, out)?;
                continue;
            }
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_ascii_lowercase();
            if !matches!(ext.as_str(), "png" | "jpg" | "jpeg" | "bmp") {
                continue;
            }
            let relative = path
                .strip_prefix(root)?
                .with_extension("")
                .to_string_lossy()
                .replace('\\', "/");
            match Self::load_one(&path) {
                Ok(template) => {
                    out.insert(
                        relative.clone(),
                        Template {
                            name: relative,
                            image: template.0,
                            mask: template.1,
                        },
                    );
                }
                Err(e) => warn!("skipping template {}: {e}", path.display()),
            }
        }
        Ok(())
    }

    fn load_one(path: &Path) -> anyhow::Result<(Mat, Option<Mat>)> {
        let img = imgcodecs::imread(
            path.to_str().ok_or_else(|| anyhow::anyhow!("non-utf8 path"))?,
            imgcodecs::IMREAD_UNCHANGED,
        )?;
        if img.empty() {
            anyhow::bail!("failed to decode image");
        }
        if img.channels() == 4 {
            let mut channels = opencv::core::Vector::<Mat>::new();
            opencv::core::split(&img, &mut channels)?;
            let alpha = channels.get(3)?;
            let mut mask = Mat::default();
            opencv::imgproc::threshold(
                &alpha,
                &mut mask,
                128.0,
                255.0,
                opencv::imgproc::THRESH_BINARY,
            )?;
            let mut bgr = Mat::default();
            let mut bgr_channels = opencv::core::Vector::<Mat>::new();
            bgr_channels.push(channels.get(0)?);
            bgr_channels.push(channels.get(1)?);
            bgr_channels.push(channels.get(2)?);
            opencv::core::merge(&bgr_channels, &mut bgr)?;
            Ok((bgr, Some(mask)))
        } else {
            let _ = CV_8UC1;
            Ok((img, None))
        }
    }

    pub fn get(&self, name: &str) -> Option<Template> {
        self.inner.read().unwrap().templates.get(name).cloned()
    }

    /// All template ids whose name starts with `prefix`, e.g. `"buttons/"`.
    pub fn names_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.inner
            .read()
            .unwrap()
            .templates
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn all_names(&self) -> Vec<String> {
        self.inner.read().unwrap().templates.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically swap in a freshly loaded cache. Readers mid-flight keep the
    /// `Arc` they already cloned.
    pub fn reload(&self) -> anyhow::Result<()> {
        let templates = Self::load_all(&self.root)?;
        let mut guard = self.inner.write().unwrap();
        *guard = Arc::new(Inner { templates });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_with_prefix_filters_correctly() {
        let mut templates = HashMap::new();
        templates.insert(
            "buttons/close_x".to_string(),
            Template {
                name: "buttons/close_x".into(),
                image: Mat::default(),
                mask: None,
            },
        );
        templates.insert(
            "icons/tutorial_finger".to_string(),
            Template {
                name: "icons/tutorial_finger".into(),
                image: Mat::default(),
                mask: None,
            },
        );
        let store = TemplateStore {
            root: PathBuf::new(),
            inner: RwLock::new(Arc::new(Inner { templates })),
        };
        let buttons = store.names_with_prefix("buttons/");
        assert_eq!(buttons, vec!["buttons/close_x".to_string()]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn missing_root_yields_empty_store() {
        let store = TemplateStore::load("/nonexistent/path/for/slgrobot/test").unwrap();
        assert!(store.is_empty());
    }
}
