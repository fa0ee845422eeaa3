//! Typed views over the well-known graph structure tags.
//!
//! Record values arrive as plain structs; these adapters name the fields of
//! the shapes a graph server actually returns. All of them stay views: no
//! field is copied out of the underlying bytes.

use crate::value::{List, Map, Struct, Value};

pub const NODE: u8 = 0x4E;
pub const RELATIONSHIP: u8 = 0x52;
pub const UNBOUND_RELATIONSHIP: u8 = 0x72;
pub const PATH: u8 = 0x50;
pub const POINT_2D: u8 = 0x58;
pub const POINT_3D: u8 = 0x59;

/// A node: `[id, labels, properties, element_id?]`. The element id exists
/// from protocol v5 on.
#[derive(Clone, Copy, Debug)]
pub struct Node<'a> {
    pub id: i64,
    pub labels: List<'a>,
    pub properties: Map<'a>,
    pub element_id: Option<&'a str>,
}

impl<'a> Node<'a> {
    pub fn from_struct(s: Struct<'a>) -> Option<Self> {
        if s.tag != NODE || s.len() < 3 {
            return None;
        }
        Some(Self {
            id: s.field(0).as_int()?,
            labels: match s.field(1) {
                Value::List(l) => l,
                _ => return None,
            },
            properties: s.field(2).as_map()?,
            element_id: s.field(3).as_str(),
        })
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.as_str() == Some(label))
    }
}

/// A relationship: `[id, start, end, type, properties, element ids...?]`.
#[derive(Clone, Copy, Debug)]
pub struct Relationship<'a> {
    pub id: i64,
    pub start_node_id: i64,
    pub end_node_id: i64,
    pub rel_type: &'a str,
    pub properties: Map<'a>,
    pub element_id: Option<&'a str>,
}

impl<'a> Relationship<'a> {
    pub fn from_struct(s: Struct<'a>) -> Option<Self> {
        if s.tag != RELATIONSHIP || s.len() < 5 {
            return None;
        }
        Some(Self {
            id: s.field(0).as_int()?,
            start_node_id: s.field(1).as_int()?,
            end_node_id: s.field(2).as_int()?,
            rel_type: s.field(3).as_str()?,
            properties: s.field(4).as_map()?,
            element_id: s.field(5).as_str(),
        })
    }
}

/// A 2D spatial point: `[srid, x, y]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point2D {
    pub srid: i64,
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    pub fn from_struct(s: Struct<'_>) -> Option<Self> {
        if s.tag != POINT_2D || s.len() != 3 {
            return None;
        }
        Some(Self {
            srid: s.field(0).as_int()?,
            x: s.field(1).as_float()?,
            y: s.field(2).as_float()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{Reader, decode_value};

    #[test]
    fn node_view() {
        // Node { id: 7, labels: ["Person"], properties: {"age": 40},
        //        element_id: "4:abc:7" }
        let mut bytes = vec![0xB4, NODE, 0x07];
        bytes.extend_from_slice(&[0x91, 0x86]);
        bytes.extend_from_slice(b"Person");
        bytes.extend_from_slice(&[0xA1, 0x83]);
        bytes.extend_from_slice(b"age");
        bytes.push(0x28);
        bytes.push(0x87);
        bytes.extend_from_slice(b"4:abc:7");

        let mut r = Reader::new(&bytes);
        let v = decode_value(&mut r).expect("decode");
        let node = Node::from_struct(v.as_struct().expect("struct")).expect("node");

        assert_eq!(node.id, 7);
        assert!(node.has_label("Person"));
        assert!(!node.has_label("Movie"));
        assert_eq!(node.properties.get("age"), Value::Int(40));
        assert_eq!(node.element_id, Some("4:abc:7"));
    }

    #[test]
    fn legacy_node_without_element_id() {
        let bytes = [0xB3, NODE, 0x01, 0x90, 0xA0];
        let mut r = Reader::new(&bytes);
        let v = decode_value(&mut r).expect("decode");
        let node = Node::from_struct(v.as_struct().expect("struct")).expect("node");
        assert_eq!(node.id, 1);
        assert_eq!(node.element_id, None);
    }

    #[test]
    fn relationship_view() {
        // Relationship { id: 3, start: 1, end: 2, type: "KNOWS", props: {} }
        let mut bytes = vec![0xB5, RELATIONSHIP, 0x03, 0x01, 0x02, 0x85];
        bytes.extend_from_slice(b"KNOWS");
        bytes.push(0xA0);

        let mut r = Reader::new(&bytes);
        let v = decode_value(&mut r).expect("decode");
        let rel = Relationship::from_struct(v.as_struct().expect("struct")).expect("rel");
        assert_eq!(rel.id, 3);
        assert_eq!(rel.start_node_id, 1);
        assert_eq!(rel.end_node_id, 2);
        assert_eq!(rel.rel_type, "KNOWS");
        assert!(rel.properties.is_empty());
    }

    #[test]
    fn point_view() {
        // Point2D { srid: 4326, x: 1.0, y: 2.0 }
        let mut bytes = vec![0xB3, POINT_2D, 0xC9, 0x10, 0xE6];
        bytes.push(0xC1);
        bytes.extend_from_slice(&1.0f64.to_be_bytes());
        bytes.push(0xC1);
        bytes.extend_from_slice(&2.0f64.to_be_bytes());

        let mut r = Reader::new(&bytes);
        let v = decode_value(&mut r).expect("decode");
        let p = Point2D::from_struct(v.as_struct().expect("struct")).expect("point");
        assert_eq!(p, Point2D { srid: 4326, x: 1.0, y: 2.0 });
    }

    #[test]
    fn wrong_tag_is_rejected() {
        let bytes = [0xB1, 0x70, 0xA0];
        let mut r = Reader::new(&bytes);
        let v = decode_value(&mut r).expect("decode");
        assert!(Node::from_struct(v.as_struct().unwrap()).is_none());
        assert!(Relationship::from_struct(v.as_struct().unwrap()).is_none());
    }
}
