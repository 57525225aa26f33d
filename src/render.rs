//! Template renderer: record + template + offsets -> visual tree.
//!
//! The tree is a flat list of absolutely positioned nodes over a background.
//! Rendering is pure; measuring (line wrapping, image heights, flow anchors)
//! happens later in [`crate::layout`] once fonts and images have settled.

use crate::error::{CertError, Result};
use crate::offsets::OffsetMap;
use crate::record::FieldValueRecord;
use crate::template::{FieldContent, FieldLayout, FontRole, Placement, TemplateLayout, TextAlign};
use crate::types::{Color, Size};
use std::collections::BTreeMap;

/// Identifier of the background/root node.
pub const ROOT_ID: &str = "certificate";

/// Stable identifier for the node of a field key.
pub fn field_node_id(key: &str) -> String {
    format!("field-{key}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(usize);

impl NodeHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextStyle {
    pub font_role: FontRole,
    pub font_size: f32,
    pub line_height: f32,
    pub align: TextAlign,
    pub color: Color,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Background { source: Option<String> },
    Text { text: String, style: TextStyle },
    Image { source: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    id: String,
    key: Option<String>,
    kind: NodeKind,
    left: i32,
    width: u32,
    natural_top: i32,
    inline_top: Option<i32>,
    height: f32,
    lines: Vec<String>,
    flow_after: Option<(NodeHandle, i32)>,
}

impl Node {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn left(&self) -> i32 {
        self.left
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    /// Top as laid out, before any inline override.
    pub fn natural_top(&self) -> i32 {
        self.natural_top
    }

    pub fn inline_top(&self) -> Option<i32> {
        self.inline_top
    }

    /// Top used for painting: the inline override when present.
    pub fn top(&self) -> i32 {
        self.inline_top.unwrap_or(self.natural_top)
    }

    pub fn height(&self) -> f32 {
        self.height
    }

    /// Wrapped lines; empty until the tree has been laid out.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn flow_after(&self) -> Option<(NodeHandle, i32)> {
        self.flow_after
    }

    pub(crate) fn set_inline_top(&mut self, value: Option<i32>) {
        self.inline_top = value;
    }

    pub(crate) fn set_measured(&mut self, natural_top: i32, height: f32, lines: Vec<String>) {
        self.natural_top = natural_top;
        self.height = height;
        self.lines = lines;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisualTree {
    size: Size,
    nodes: Vec<Node>,
    fields: BTreeMap<String, NodeHandle>,
    laid_out: bool,
}

impl VisualTree {
    pub fn size(&self) -> Size {
        self.size
    }

    pub fn root(&self) -> NodeHandle {
        NodeHandle(0)
    }

    pub fn handle(&self, key: &str) -> Option<NodeHandle> {
        self.fields.get(key).copied()
    }

    /// Field key -> node handle, as produced at render time.
    pub fn handles(&self) -> &BTreeMap<String, NodeHandle> {
        &self.fields
    }

    /// `None` for a handle that does not belong to this tree.
    pub fn node(&self, handle: NodeHandle) -> Option<&Node> {
        self.nodes.get(handle.0)
    }

    /// Node of a field key.
    pub fn field(&self, key: &str) -> Option<&Node> {
        self.handle(key).and_then(|handle| self.node(handle))
    }

    pub(crate) fn node_mut(&mut self, handle: NodeHandle) -> Option<&mut Node> {
        self.nodes.get_mut(handle.0)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeHandle, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (NodeHandle(index), node))
    }

    pub fn find_by_id(&self, id: &str) -> Option<NodeHandle> {
        self.nodes
            .iter()
            .position(|node| node.id == id)
            .map(NodeHandle)
    }

    pub fn is_laid_out(&self) -> bool {
        self.laid_out
    }

    pub(crate) fn mark_laid_out(&mut self) {
        self.laid_out = true;
    }

    /// Painted tops of every keyed node.
    pub fn positions(&self) -> BTreeMap<String, i32> {
        self.fields
            .iter()
            .filter_map(|(key, handle)| Some((key.clone(), self.node(*handle)?.top())))
            .collect()
    }
}

/// Builds the visual tree for one record.
///
/// Each keyed node's top is `field.top + offsets[key]`. Record values are
/// read, never modified; text transforms and the two-tier size rule are
/// applied to the rendered copy only.
pub fn render(
    values: &FieldValueRecord,
    layout: &TemplateLayout,
    offsets: &OffsetMap,
) -> Result<VisualTree> {
    let mut nodes = Vec::with_capacity(layout.fields.len() + 1);
    let mut fields = BTreeMap::new();
    nodes.push(Node {
        id: ROOT_ID.to_string(),
        key: None,
        kind: NodeKind::Background {
            source: layout.background.clone(),
        },
        left: 0,
        width: layout.width,
        natural_top: 0,
        inline_top: None,
        height: layout.height as f32,
        lines: Vec::new(),
        flow_after: None,
    });

    for field in &layout.fields {
        let kind = match &field.content {
            FieldContent::Record => {
                let raw = values
                    .get(&field.key)
                    .ok_or_else(|| CertError::MissingField(field.key.clone()))?;
                text_kind(raw, field, layout)
            }
            FieldContent::Static { text } => text_kind(text, field, layout),
            FieldContent::Image { source, .. } => NodeKind::Image {
                source: source.clone(),
            },
        };
        let width = match &field.content {
            FieldContent::Image { width, .. } => *width,
            _ => field.placement.width(),
        };
        let left = match (&field.content, field.placement) {
            (FieldContent::Image { width, .. }, Placement::Centered { center_x, .. }) => {
                center_x - (*width / 2) as i32
            }
            _ => field.placement.left(),
        };
        let flow_after = match &field.flow_after {
            Some(anchor) => {
                let handle = fields.get(&anchor.field).copied().ok_or_else(|| {
                    CertError::InvalidConfiguration(format!(
                        "element {:?} flows after undeclared element {:?}",
                        field.key, anchor.field
                    ))
                })?;
                Some((handle, anchor.gap))
            }
            None => None,
        };

        let handle = NodeHandle(nodes.len());
        nodes.push(Node {
            id: field_node_id(&field.key),
            key: Some(field.key.clone()),
            kind,
            left,
            width,
            natural_top: field.top + offsets.get(&field.key),
            inline_top: None,
            height: 0.0,
            lines: Vec::new(),
            flow_after,
        });
        fields.insert(field.key.clone(), handle);
    }

    Ok(VisualTree {
        size: layout.size(),
        nodes,
        fields,
        laid_out: false,
    })
}

fn text_kind(raw: &str, field: &FieldLayout, layout: &TemplateLayout) -> NodeKind {
    NodeKind::Text {
        text: field.transform.apply(raw),
        style: TextStyle {
            font_role: field.font_role,
            font_size: field.font_size_for(raw),
            line_height: field.line_height,
            align: field.placement.align(),
            color: field.color.unwrap_or(layout.text_color),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{
        FIELD_CERTIFICATE_DATE, FIELD_PROGRAM_NAME, FIELD_RECIPIENT_NAME, FIELD_SIGNATURE,
        builtin_template,
    };

    fn sample_record() -> FieldValueRecord {
        FieldValueRecord::from_pairs([
            ("organization", "Acme"),
            ("programName", "Excellence Award"),
            ("achievementText", "For outstanding work"),
            ("recipientName", "Jane Doe"),
            ("certificateDate", "Awarded January 2025"),
        ])
    }

    #[test]
    fn every_declared_element_gets_a_stable_handle_and_id() {
        let template = builtin_template("pak").unwrap();
        let tree = render(&sample_record(), &template, &OffsetMap::default()).unwrap();
        assert_eq!(tree.size(), template.size());
        assert_eq!(tree.node(tree.root()).unwrap().id(), ROOT_ID);
        for field in &template.fields {
            let handle = tree.handle(&field.key).unwrap();
            assert_eq!(tree.node(handle).unwrap().id(), field_node_id(&field.key));
            assert_eq!(tree.find_by_id(&field_node_id(&field.key)), Some(handle));
        }
    }

    #[test]
    fn foreign_handles_resolve_to_none() {
        let template = builtin_template("pak").unwrap();
        let tree = render(&sample_record(), &template, &OffsetMap::default()).unwrap();
        let mut small = builtin_template("pak").unwrap();
        small.fields.truncate(1);
        let small_tree = render(&sample_record(), &small, &OffsetMap::default()).unwrap();
        let last = tree.nodes().last().map(|(handle, _)| handle).unwrap();
        assert!(small_tree.node(last).is_none());
        assert!(small_tree.field(FIELD_SIGNATURE).is_none());
    }

    #[test]
    fn top_is_base_plus_offset_and_absent_keys_are_zero() {
        let template = builtin_template("pak").unwrap();
        let offsets = OffsetMap::from_pairs([(FIELD_RECIPIENT_NAME, -16)]);
        let tree = render(&sample_record(), &template, &offsets).unwrap();
        let name = tree.field(FIELD_RECIPIENT_NAME).unwrap();
        assert_eq!(name.top(), 320 - 16);
        let date = tree.field(FIELD_CERTIFICATE_DATE).unwrap();
        assert_eq!(date.top(), 370);
    }

    #[test]
    fn transforms_apply_to_rendered_copy_only() {
        let template = builtin_template("pak").unwrap();
        let record = sample_record();
        let before = record.clone();
        let tree = render(&record, &template, &OffsetMap::default()).unwrap();
        let NodeKind::Text { text, .. } = tree.field(FIELD_RECIPIENT_NAME).unwrap().kind()
        else {
            panic!("recipient should be text");
        };
        assert_eq!(text, "JANE DOE");
        assert_eq!(record, before);
    }

    #[test]
    fn long_program_name_selects_reduced_size() {
        let template = builtin_template("pak").unwrap();
        let mut record = sample_record();
        record.set(FIELD_PROGRAM_NAME, "a".repeat(50));
        let tree = render(&record, &template, &OffsetMap::default()).unwrap();
        let NodeKind::Text { style, .. } = tree.field(FIELD_PROGRAM_NAME).unwrap().kind()
        else {
            panic!("program name should be text");
        };
        assert_eq!(style.font_size, 16.0);
    }

    #[test]
    fn missing_declared_field_is_an_error() {
        let template = builtin_template("pak").unwrap();
        let mut record = sample_record();
        record.remove(FIELD_RECIPIENT_NAME);
        let err = render(&record, &template, &OffsetMap::default()).unwrap_err();
        assert!(matches!(err, CertError::MissingField(key) if key == FIELD_RECIPIENT_NAME));
    }

    #[test]
    fn unknown_record_keys_are_ignored() {
        let template = builtin_template("pak").unwrap();
        let mut record = sample_record();
        record.set("favouriteColour", "teal");
        let tree = render(&record, &template, &OffsetMap::default()).unwrap();
        assert!(tree.handle("favouriteColour").is_none());
    }

    #[test]
    fn centered_image_box_uses_image_width() {
        let template = builtin_template("pak").unwrap();
        let tree = render(&sample_record(), &template, &OffsetMap::default()).unwrap();
        let signature = tree.field(FIELD_SIGNATURE).unwrap();
        assert_eq!(signature.width(), 300);
        assert_eq!(signature.left(), 472 - 150);
    }
}
