//! Resource readiness gate.
//!
//! Settles every font slot and every image source a tree references before
//! anything is measured or captured. Settling never fails: a broken image is
//! logged and painted as a blank area.

use crate::assets::{SourceKind, load_image_pixmap};
use crate::font::FontBook;
use crate::render::{NodeHandle, NodeKind, VisualTree};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tiny_skia::Pixmap;

/// Decoded image cache shared by every stage of one pipeline. Only
/// successful decodes are kept.
#[derive(Debug, Default)]
pub struct ResourceGate {
    images: Mutex<HashMap<String, Arc<Pixmap>>>,
}

/// What the gate settled for one tree.
#[derive(Debug, Clone, Default)]
pub struct StageResources {
    background: Option<Arc<Pixmap>>,
    images: BTreeMap<NodeHandle, Arc<Pixmap>>,
    settled_images: usize,
    broken_images: usize,
    usable_fonts: usize,
}

impl StageResources {
    pub fn background(&self) -> Option<&Pixmap> {
        self.background.as_deref()
    }

    pub fn image(&self, handle: NodeHandle) -> Option<&Pixmap> {
        self.images.get(&handle).map(Arc::as_ref)
    }

    /// Image sources that completed or errored.
    pub fn settled_images(&self) -> usize {
        self.settled_images
    }

    pub fn broken_images(&self) -> usize {
        self.broken_images
    }

    pub fn usable_fonts(&self) -> usize {
        self.usable_fonts
    }
}

impl ResourceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns once every font and image source of `tree` has settled.
    pub fn await_ready(&self, tree: &VisualTree, fonts: &FontBook) -> StageResources {
        let mut resources = StageResources {
            usable_fonts: fonts.settle(),
            ..StageResources::default()
        };

        for (handle, node) in tree.nodes() {
            let source = match node.kind() {
                NodeKind::Background { source: Some(source) } => source,
                NodeKind::Image { source } => source,
                _ => continue,
            };
            resources.settled_images += 1;
            let Some(pixmap) = self.settle_image(source) else {
                resources.broken_images += 1;
                continue;
            };
            if handle == tree.root() {
                resources.background = Some(pixmap);
            } else {
                resources.images.insert(handle, pixmap);
            }
        }

        log::debug!(
            "resources ready: {} image(s), {} broken, {} font(s)",
            resources.settled_images,
            resources.broken_images,
            resources.usable_fonts
        );
        resources
    }

    fn settle_image(&self, source: &str) -> Option<Arc<Pixmap>> {
        let mut cache = self
            .images
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(pixmap) = cache.get(source) {
            return Some(Arc::clone(pixmap));
        }
        // Failures stay uncached so the next export retries the source.
        match load_image_pixmap(source) {
            Ok(pixmap) => {
                let pixmap = Arc::new(pixmap);
                cache.insert(source.to_string(), Arc::clone(&pixmap));
                Some(pixmap)
            }
            Err(err) => {
                let label = match SourceKind::of(source) {
                    SourceKind::DataUri => "<data uri>",
                    SourceKind::File => source,
                };
                log::warn!("image {label} will render blank: {err}");
                None
            }
        }
    }

    pub fn cached_sources(&self) -> usize {
        self.images
            .lock()
            .map(|cache| cache.len())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::png_data_uri;
    use crate::assets::tests::png_bytes;
    use crate::offsets::OffsetMap;
    use crate::record::FieldValueRecord;
    use crate::render::render;
    use crate::template::{FIELD_SIGNATURE, FieldContent, builtin_template};

    fn record() -> FieldValueRecord {
        FieldValueRecord::from_pairs([
            ("organization", "Acme"),
            ("programName", "Excellence Award"),
            ("achievementText", "For outstanding work"),
            ("recipientName", "Jane Doe"),
            ("certificateDate", "Awarded January 2025"),
        ])
    }

    #[test]
    fn broken_images_settle_without_failing() {
        let mut template = builtin_template("pak").unwrap();
        template.background = Some("/missing/background.jpg".to_string());
        let tree = render(&record(), &template, &OffsetMap::default()).unwrap();
        let gate = ResourceGate::new();
        let resources = gate.await_ready(&tree, &FontBook::new());
        assert_eq!(resources.settled_images(), 2);
        assert_eq!(resources.broken_images(), 2);
        assert!(resources.background().is_none());
    }

    #[test]
    fn decoded_images_are_keyed_by_handle_and_cached() {
        let mut template = builtin_template("pak").unwrap();
        let uri = png_data_uri(&png_bytes(8, 4, [0, 0, 0, 255]));
        template.background = Some(uri.clone());
        for field in &mut template.fields {
            if let FieldContent::Image { source, .. } = &mut field.content {
                *source = uri.clone();
            }
        }
        let tree = render(&record(), &template, &OffsetMap::default()).unwrap();
        let gate = ResourceGate::new();
        let resources = gate.await_ready(&tree, &FontBook::new());
        assert_eq!(resources.broken_images(), 0);
        assert_eq!(resources.background().map(|p| p.width()), Some(8));
        let signature = tree.handle(FIELD_SIGNATURE).unwrap();
        assert_eq!(resources.image(signature).map(|p| p.height()), Some(4));
        assert_eq!(gate.cached_sources(), 1);
    }

    #[test]
    fn failed_sources_are_retried_on_the_next_settle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("background.png");
        let mut template = builtin_template("pak").unwrap();
        template.background = Some(path.to_string_lossy().into_owned());
        let tree = render(&record(), &template, &OffsetMap::default()).unwrap();
        let gate = ResourceGate::new();

        let first = gate.await_ready(&tree, &FontBook::new());
        assert!(first.background().is_none());
        assert_eq!(gate.cached_sources(), 0);

        std::fs::write(&path, png_bytes(6, 3, [10, 20, 30, 255])).unwrap();
        let second = gate.await_ready(&tree, &FontBook::new());
        assert_eq!(second.background().map(|p| p.width()), Some(6));
        assert_eq!(gate.cached_sources(), 1);
    }
}
