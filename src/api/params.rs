//! Purpose: The params message a plugin sends when the orchestrator asks what a file exposes.
//! Exports: `ParamsMessage`, `ParamsObject`, `ParamsDocument`, `ParamDescriptor`, `ParamSpec`,
//!          `GeometryDefault`.
//! Role: Parameter discovery; one JSON document per geometry-nodes object.
//! Invariants: Geometry defaults follow the objects, one slot per OBJECT param of the last object.
//! Invariants: An empty class text marks a slot with no default geometry.

use serde::{Deserialize, Deserializer, Serialize};

use crate::api::export::{count_i32, read_count};
use crate::api::geometry::{GeometryPayload, GeometryRegistry};
use crate::api::import::UnknownParam;
use crate::core::codec::{Reader, Writer};
use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum ParamSpec {
    #[serde(rename = "INT")]
    Int {
        #[serde(rename = "MinValue", default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(rename = "MaxValue", default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        #[serde(rename = "DefaultValue", default, skip_serializing_if = "Option::is_none")]
        default: Option<i64>,
    },
    #[serde(rename = "VALUE")]
    Value {
        #[serde(rename = "MinValue", default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(rename = "MaxValue", default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        #[serde(rename = "DefaultValue", default, skip_serializing_if = "Option::is_none")]
        default: Option<f64>,
    },
    #[serde(rename = "VECTOR")]
    Vector {
        #[serde(rename = "MinValue", default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(rename = "MaxValue", default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        #[serde(rename = "DefaultValue", default, skip_serializing_if = "Option::is_none")]
        default: Option<[f64; 3]>,
    },
    #[serde(rename = "ROTATION")]
    Rotation {
        #[serde(rename = "DefaultValue", default, skip_serializing_if = "Option::is_none")]
        default: Option<[f64; 3]>,
    },
    #[serde(rename = "RGBA")]
    Rgba {
        #[serde(rename = "DefaultValue", default, skip_serializing_if = "Option::is_none")]
        default: Option<[f64; 4]>,
    },
    #[serde(rename = "BOOLEAN")]
    Boolean {
        #[serde(rename = "DefaultValue", default, skip_serializing_if = "Option::is_none")]
        default: Option<bool>,
    },
    #[serde(rename = "STRING")]
    String {
        #[serde(rename = "DefaultValue", default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    #[serde(rename = "MENU")]
    Menu {
        #[serde(rename = "Entries", default)]
        entries: Vec<String>,
        #[serde(rename = "Values", default)]
        values: Vec<i64>,
        #[serde(rename = "DefaultValue", default, skip_serializing_if = "Option::is_none")]
        default: Option<serde_json::Value>,
    },
    #[serde(rename = "OBJECT")]
    Object,
    #[serde(rename = "COLLECTION")]
    Collection,
    #[serde(rename = "TEXTURE", alias = "IMAGE")]
    Texture,
    #[serde(untagged)]
    Other(#[serde(deserialize_with = "other_spec")] UnknownParam),
}

impl ParamSpec {
    const TYPES: &'static [&'static str] = &[
        "INT",
        "VALUE",
        "VECTOR",
        "ROTATION",
        "RGBA",
        "BOOLEAN",
        "STRING",
        "MENU",
        "OBJECT",
        "COLLECTION",
        "TEXTURE",
        "IMAGE",
    ];
}

fn other_spec<'de, D>(deserializer: D) -> Result<UnknownParam, D::Error>
where
    D: Deserializer<'de>,
{
    UnknownParam::deserialize_excluding(deserializer, ParamSpec::TYPES)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamDescriptor {
    #[serde(rename = "NodeGroup", default, skip_serializing_if = "Option::is_none")]
    pub node_group: Option<String>,
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "Panel", default, skip_serializing_if = "Option::is_none")]
    pub panel: Option<String>,
    #[serde(rename = "Tooltip", default, skip_serializing_if = "Option::is_none")]
    pub tooltip: Option<String>,
    #[serde(flatten)]
    pub spec: ParamSpec,
}

impl ParamDescriptor {
    pub fn is_object(&self) -> bool {
        matches!(self.spec, ParamSpec::Object)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamsDocument {
    #[serde(rename = "Params", default)]
    pub params: Vec<ParamDescriptor>,
    #[serde(rename = "Materials", default)]
    pub materials: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamsObject {
    pub name: String,
    pub document: ParamsDocument,
}

/// Geometry assigned to an OBJECT param in the source file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeometryDefault {
    pub class: String,
    pub payload: GeometryPayload,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamsMessage {
    pub objects: Vec<ParamsObject>,
    #[serde(default)]
    pub geometry_defaults: Vec<Option<GeometryDefault>>,
}

impl ParamsMessage {
    fn object_param_count(&self) -> usize {
        self.objects.last().map_or(0, |object| {
            object
                .document
                .params
                .iter()
                .filter(|param| param.is_object())
                .count()
        })
    }

    pub fn encode(&self, writer: &mut Writer<'_>, registry: &GeometryRegistry) -> Result<(), Error> {
        let slots = self.object_param_count();
        if self.geometry_defaults.len() != slots {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "{} geometry defaults for {slots} OBJECT params",
                    self.geometry_defaults.len()
                ))
                .with_hint("Provide one entry per OBJECT param of the last object; use None when unset."));
        }

        writer.write_value(count_i32(self.objects.len())?)?;
        for object in &self.objects {
            writer.write_text(&object.name)?;
            let document = serde_json::to_string(&object.document).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode params document")
                    .with_source(err)
            })?;
            writer.write_text(&document)?;
        }
        for slot in &self.geometry_defaults {
            match slot {
                Some(default) => {
                    writer.write_text(&default.class)?;
                    registry.encode(&default.class, &default.payload, writer)?;
                }
                None => writer.write_text("")?,
            }
        }
        Ok(())
    }

    pub fn decode(reader: &mut Reader<'_>, registry: &GeometryRegistry) -> Result<Self, Error> {
        let count = read_count(reader, "object")?;
        let mut objects = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            let name = reader.read_text()?;
            let at = reader.position();
            let text = reader.read_text()?;
            let document = crate::json::parse::from_str::<ParamsDocument>(&text).map_err(|err| {
                Error::new(ErrorKind::Decode)
                    .with_message(format!("params document for {name:?} is not valid JSON"))
                    .with_hint(crate::json::parse::hint_for_error(&err, "params.document"))
                    .with_offset(at as u64)
            })?;
            objects.push(ParamsObject { name, document });
        }

        let mut message = Self {
            objects,
            geometry_defaults: Vec::new(),
        };
        for _ in 0..message.object_param_count() {
            let class = reader.read_text()?;
            if class.is_empty() {
                message.geometry_defaults.push(None);
                continue;
            }
            let payload = registry.decode(&class, reader)?;
            message
                .geometry_defaults
                .push(Some(GeometryDefault { class, payload }));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::geometry::SPLINE_CLASS;
    use crate::api::geometry::SplineInput;

    const DOCUMENT: &str = r#"{"Params":[
        {"NodeGroup":"GeometryNodes","Id":"Socket_2","Name":"Density","Type":"VALUE",
         "Panel":"","Tooltip":"","MinValue":0.0,"MaxValue":10.0,"DefaultValue":1.5},
        {"NodeGroup":"GeometryNodes","Id":"Socket_3","Name":"Mode","Type":"MENU",
         "Panel":"Options","Tooltip":"","Entries":["A","B"],"Values":[0,1],"DefaultValue":"A"},
        {"NodeGroup":"GeometryNodes","Id":"Socket_4","Name":"Path","Type":"OBJECT",
         "Panel":"","Tooltip":"Guide curve"},
        {"NodeGroup":"GeometryNodes","Id":"Socket_5","Name":"Shader","Type":"SHADER"}
    ],"Materials":["Rock","Moss"]}"#;

    #[test]
    fn descriptors_carry_typed_specs() {
        let document: ParamsDocument = crate::json::parse::from_str(DOCUMENT).expect("parse");
        assert_eq!(document.materials, vec!["Rock", "Moss"]);
        assert_eq!(
            document.params[0].spec,
            ParamSpec::Value {
                min: Some(0.0),
                max: Some(10.0),
                default: Some(1.5)
            }
        );
        assert!(
            matches!(&document.params[1].spec, ParamSpec::Menu { entries, .. } if entries.len() == 2)
        );
        assert_eq!(document.params[1].panel.as_deref(), Some("Options"));
        assert!(document.params[2].is_object());
        assert_eq!(document.params[2].tooltip.as_deref(), Some("Guide curve"));
        assert_eq!(document.params[3].panel, None);
        assert!(matches!(&document.params[3].spec, ParamSpec::Other(other) if other.kind == "SHADER"));
    }

    #[test]
    fn unknown_specs_survive_a_re_encode() {
        let descriptor = serde_json::json!({
            "NodeGroup": "GeometryNodes",
            "Id": "Socket_5",
            "Name": "Shader",
            "Type": "SHADER",
            "DefaultValue": {"Material": "Glass"}
        });
        let document: ParamsDocument = crate::json::parse::from_str(
            &serde_json::json!({"Params": [descriptor.clone()], "Materials": []}).to_string(),
        )
        .expect("parse");
        let value = serde_json::to_value(&document).expect("encode");
        assert_eq!(value["Params"][0], descriptor);
    }

    #[test]
    fn malformed_known_spec_is_rejected() {
        let result = crate::json::parse::from_str::<ParamsDocument>(
            r#"{"Params":[{"Id":"Socket_2","Type":"VALUE","DefaultValue":"high"}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn geometry_defaults_follow_the_objects() {
        let registry = GeometryRegistry::default();
        let document: ParamsDocument = crate::json::parse::from_str(DOCUMENT).expect("parse");
        let spline = SplineInput {
            resolution: 12,
            cyclic: false,
            locations: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]],
            scales: vec![[1.0, 1.0, 1.0]; 2],
            rolls: vec![0.0; 2],
            leave_tangents: vec![[0.5, 0.0, 0.0]; 2],
            arrive_tangents: vec![[-0.5, 0.0, 0.0]; 2],
            point_types: vec![0; 2],
        };
        let message = ParamsMessage {
            objects: vec![ParamsObject {
                name: "Scatter".to_string(),
                document,
            }],
            geometry_defaults: vec![Some(GeometryDefault {
                class: SPLINE_CLASS.to_string(),
                payload: GeometryPayload::Spline(spline),
            })],
        };

        let mut buf = vec![0u8; 16 * 1024];
        let mut writer = Writer::new(&mut buf);
        message.encode(&mut writer, &registry).expect("encode");
        let len = writer.position();

        let mut reader = Reader::new(&buf[..len]);
        let decoded = ParamsMessage::decode(&mut reader, &registry).expect("decode");
        assert!(reader.is_exhausted());
        assert_eq!(decoded.objects[0].name, "Scatter");
        assert_eq!(decoded.geometry_defaults, message.geometry_defaults);
    }

    #[test]
    fn unset_object_param_writes_an_empty_class() {
        let registry = GeometryRegistry::default();
        let message = ParamsMessage {
            objects: vec![ParamsObject {
                name: "Scatter".to_string(),
                document: crate::json::parse::from_str(DOCUMENT).expect("parse"),
            }],
            geometry_defaults: vec![None],
        };
        let mut buf = vec![0u8; 8 * 1024];
        let mut writer = Writer::new(&mut buf);
        message.encode(&mut writer, &registry).expect("encode");
        let len = writer.position();

        let mut reader = Reader::new(&buf[..len]);
        let decoded = ParamsMessage::decode(&mut reader, &registry).expect("decode");
        assert_eq!(decoded.geometry_defaults, vec![None]);
    }

    #[test]
    fn default_slots_must_match_object_params() {
        let message = ParamsMessage {
            objects: vec![ParamsObject {
                name: "Scatter".to_string(),
                document: crate::json::parse::from_str(DOCUMENT).expect("parse"),
            }],
            geometry_defaults: Vec::new(),
        };
        let mut buf = vec![0u8; 8 * 1024];
        let err = message
            .encode(&mut Writer::new(&mut buf), &GeometryRegistry::default())
            .expect_err("slot count");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn malformed_document_is_a_decode_error() {
        let mut buf = vec![0u8; 256];
        let mut writer = Writer::new(&mut buf);
        writer.write_value(1i32).expect("count");
        writer.write_text("Scatter").expect("name");
        writer.write_text("{\"Params\":[").expect("doc");
        let len = writer.position();

        let err = ParamsMessage::decode(&mut Reader::new(&buf[..len]), &GeometryRegistry::default())
            .expect_err("bad json");
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert!(err.hint().is_some_and(|hint| hint.contains("params.document")));
    }
}
