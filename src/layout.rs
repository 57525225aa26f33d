//! Measure pass: wraps text, sizes images and resolves flow anchors.
//!
//! Runs once per tree, after the readiness gate, so glyph metrics and image
//! aspect ratios are final.

use crate::font::FontBook;
use crate::readiness::StageResources;
use crate::render::{NodeKind, VisualTree};

pub fn layout(tree: &mut VisualTree, fonts: &FontBook, resources: &StageResources) {
    if tree.is_laid_out() {
        return;
    }
    let handles: Vec<_> = tree.nodes().map(|(handle, _)| handle).collect();
    for handle in handles {
        let Some(node) = tree.node(handle) else {
            continue;
        };
        let (height, lines) = match node.kind() {
            NodeKind::Background { .. } => (node.height(), Vec::new()),
            NodeKind::Text { text, style } => {
                let lines = fonts.wrap(style.font_role, text, style.font_size, node.width() as f32);
                let height = lines.len() as f32 * style.font_size * style.line_height;
                (height, lines)
            }
            NodeKind::Image { .. } => {
                let height = resources
                    .image(handle)
                    .map(|img| node.width() as f32 * img.height() as f32 / img.width() as f32)
                    .unwrap_or(0.0);
                (height, Vec::new())
            }
        };

        let mut natural_top = node.natural_top();
        if let Some((anchor, gap)) = node.flow_after() {
            if let Some(anchor) = tree.node(anchor) {
                let anchor_bottom = anchor.natural_top() + anchor.height().ceil() as i32;
                natural_top = natural_top.max(anchor_bottom + gap);
            }
        }
        if let Some(node) = tree.node_mut(handle) {
            node.set_measured(natural_top, height, lines);
        }
    }
    tree.mark_laid_out();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offsets::OffsetMap;
    use crate::record::FieldValueRecord;
    use crate::render::render;
    use crate::template::{
        FIELD_ACHIEVEMENT_TEXT, FIELD_CERTIFICATE_DATE, FIELD_RECIPIENT_NAME, builtin_template,
    };

    fn record(achievement: &str) -> FieldValueRecord {
        FieldValueRecord::from_pairs([
            ("organization", "Acme"),
            ("programName", "Excellence Award"),
            ("achievementText", achievement),
            ("recipientName", "Jane Doe"),
            ("certificateDate", "Awarded January 2025"),
        ])
    }

    fn laid_out(achievement: &str) -> VisualTree {
        let template = builtin_template("pak").unwrap();
        let mut tree = render(&record(achievement), &template, &OffsetMap::default()).unwrap();
        layout(&mut tree, &FontBook::new(), &StageResources::default());
        tree
    }

    #[test]
    fn short_text_keeps_authored_positions() {
        let tree = laid_out("For outstanding work");
        assert!(tree.is_laid_out());
        let achievement = tree.field(FIELD_ACHIEVEMENT_TEXT).unwrap();
        assert_eq!(achievement.lines().len(), 1);
        // one line at 20px * 1.4
        assert_eq!(achievement.height(), 28.0);
        let name = tree.field(FIELD_RECIPIENT_NAME).unwrap();
        assert_eq!(name.natural_top(), 320);
    }

    #[test]
    fn long_achievement_pushes_following_fields_down() {
        // 300 chars at the 10px fallback advance wraps to five lines in 600px.
        let long = vec!["abcdefghi"; 30].join(" ");
        let tree = laid_out(&long);
        let achievement = tree.field(FIELD_ACHIEVEMENT_TEXT).unwrap();
        let lines = achievement.lines().len();
        assert!(lines >= 5, "{lines} lines");
        let bottom = 210 + achievement.height().ceil() as i32;
        let name = tree.field(FIELD_RECIPIENT_NAME).unwrap();
        assert_eq!(name.natural_top(), (bottom + 8).max(320));
        let date = tree.field(FIELD_CERTIFICATE_DATE).unwrap();
        let name_bottom = name.natural_top() + name.height().ceil() as i32;
        assert_eq!(date.natural_top(), (name_bottom + 10).max(370));
        assert!(date.natural_top() > 370);
    }

    #[test]
    fn empty_text_has_no_height_and_missing_images_collapse() {
        let tree = laid_out("");
        let achievement = tree.field(FIELD_ACHIEVEMENT_TEXT).unwrap();
        assert_eq!(achievement.height(), 0.0);
        let signature = tree.field("signature").unwrap();
        assert_eq!(signature.height(), 0.0);
    }

    #[test]
    fn layout_runs_once() {
        let mut tree = laid_out("For outstanding work");
        let before = tree.clone();
        layout(&mut tree, &FontBook::new(), &StageResources::default());
        assert_eq!(tree, before);
    }
}
