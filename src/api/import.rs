//! Purpose: The import message: parameter JSON plus inline resources, host to plugin.
//! Exports: `ImportMessage`, `ImportParam`, `ParamValue`, `Vector3`, `Rgba`, `AttributeRequest`,
//!          `ImportBundle`, `ParamResource`, `ResourceData`, `TexturePixels`.
//! Role: Typed view of the orchestrator's parameter payload and its blob order.
//! Invariants: Resources follow the JSON text in parameter order, one slot per resource-typed param.
//! Invariants: Unknown parameter types decode to `ParamValue::Unknown`, keep every key as sent,
//!             and carry no resource.

use serde::de::{Deserializer, Error as _};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::api::geometry::{GeometryPayload, GeometryRegistry};
use crate::api::message::Received;
use crate::core::codec::{Reader, Writer};
use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    #[serde(rename = "X")]
    pub x: f64,
    #[serde(rename = "Y")]
    pub y: f64,
    #[serde(rename = "Z")]
    pub z: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rgba {
    #[serde(rename = "R")]
    pub r: f64,
    #[serde(rename = "G")]
    pub g: f64,
    #[serde(rename = "B")]
    pub b: f64,
    #[serde(rename = "A")]
    pub a: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum ParamValue {
    #[serde(rename = "VALUE")]
    Value {
        #[serde(rename = "Value", deserialize_with = "lenient::float")]
        value: f64,
    },
    #[serde(rename = "INT")]
    Int {
        #[serde(rename = "Value", deserialize_with = "lenient::int")]
        value: i64,
    },
    #[serde(rename = "BOOLEAN")]
    Boolean {
        #[serde(rename = "Value", deserialize_with = "lenient::boolean")]
        value: bool,
    },
    #[serde(rename = "STRING")]
    String {
        #[serde(rename = "Value")]
        value: String,
    },
    #[serde(rename = "MENU")]
    Menu {
        #[serde(rename = "Value", deserialize_with = "lenient::int")]
        value: i64,
    },
    #[serde(rename = "VECTOR")]
    Vector {
        #[serde(rename = "Value")]
        value: Vec<Vector3>,
    },
    #[serde(rename = "ROTATION")]
    Rotation {
        #[serde(rename = "Value")]
        value: Vec<Vector3>,
    },
    #[serde(rename = "RGBA")]
    Rgba {
        #[serde(rename = "Value")]
        value: Vec<Rgba>,
    },
    #[serde(rename = "TEXTURE", alias = "IMAGE")]
    Texture {
        #[serde(rename = "X", deserialize_with = "lenient::dimension")]
        width: u32,
        #[serde(rename = "Y", deserialize_with = "lenient::dimension")]
        height: u32,
    },
    #[serde(rename = "MESH")]
    Mesh {
        #[serde(rename = "Class")]
        class: String,
    },
    #[serde(rename = "COLLECTION")]
    Collection {
        #[serde(rename = "Num", deserialize_with = "lenient::dimension")]
        count: u32,
        #[serde(rename = "Classes", default)]
        classes: Vec<String>,
    },
    /// A `Type` this crate does not model, re-encoded with the keys it arrived with.
    #[serde(untagged)]
    Unknown(#[serde(deserialize_with = "unknown_value")] UnknownParam),
}

impl ParamValue {
    const TYPES: &'static [&'static str] = &[
        "VALUE",
        "INT",
        "BOOLEAN",
        "STRING",
        "MENU",
        "VECTOR",
        "ROTATION",
        "RGBA",
        "TEXTURE",
        "IMAGE",
        "MESH",
        "COLLECTION",
    ];

    fn kind(&self) -> &str {
        match self {
            ParamValue::Value { .. } => "VALUE",
            ParamValue::Int { .. } => "INT",
            ParamValue::Boolean { .. } => "BOOLEAN",
            ParamValue::String { .. } => "STRING",
            ParamValue::Menu { .. } => "MENU",
            ParamValue::Vector { .. } => "VECTOR",
            ParamValue::Rotation { .. } => "ROTATION",
            ParamValue::Rgba { .. } => "RGBA",
            ParamValue::Texture { .. } => "TEXTURE",
            ParamValue::Mesh { .. } => "MESH",
            ParamValue::Collection { .. } => "COLLECTION",
            ParamValue::Unknown(param) => param.kind.as_str(),
        }
    }

    pub fn has_resource(&self) -> bool {
        matches!(
            self,
            ParamValue::Texture { .. } | ParamValue::Mesh { .. } | ParamValue::Collection { .. }
        )
    }
}

/// A parameter object whose `Type` is not one of the modelled kinds.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UnknownParam {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl UnknownParam {
    /// Fails for tags in `known`, so a malformed known parameter stays an error
    /// instead of passing through as unknown.
    pub(crate) fn deserialize_excluding<'de, D>(
        deserializer: D,
        known: &[&str],
    ) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut fields = Map::<String, Value>::deserialize(deserializer)?;
        let kind = match fields.remove("Type") {
            Some(Value::String(kind)) => kind,
            Some(_) => return Err(D::Error::custom("parameter Type must be a string")),
            None => return Err(D::Error::missing_field("Type")),
        };
        if known.contains(&kind.as_str()) {
            return Err(D::Error::custom(format!("invalid {kind} parameter")));
        }
        Ok(Self { kind, fields })
    }
}

fn unknown_value<'de, D>(deserializer: D) -> Result<UnknownParam, D::Error>
where
    D: Deserializer<'de>,
{
    UnknownParam::deserialize_excluding(deserializer, ParamValue::TYPES)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImportParam {
    #[serde(rename = "NodeGroup", default, skip_serializing_if = "Option::is_none")]
    pub node_group: Option<String>,
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(flatten)]
    pub value: ParamValue,
}

impl ImportParam {
    pub fn new(id: impl Into<String>, value: ParamValue) -> Self {
        Self {
            node_group: None,
            id: id.into(),
            value,
        }
    }

    /// Whether the parameter targets `modifier`; "None" and absent groups match all.
    pub fn applies_to(&self, modifier: &str) -> bool {
        match self.node_group.as_deref() {
            None | Some("None") => true,
            Some(group) => group == modifier,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRequest {
    #[serde(rename = "AttributeName")]
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportMessage {
    #[serde(rename = "Object", default)]
    pub object: String,
    #[serde(rename = "Frame", default)]
    pub frame: i32,
    #[serde(rename = "Params", default)]
    pub params: Vec<ImportParam>,
    #[serde(rename = "Attributes", default)]
    pub attributes: Vec<AttributeRequest>,
}

impl ImportMessage {
    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode import message")
                .with_source(err)
        })
    }

    /// The frame to evaluate, wrapped into `1..=frame_end` the way the plugin applies it.
    pub fn wrapped_frame(&self, frame_end: i32) -> i32 {
        if frame_end <= 0 {
            return self.frame;
        }
        self.frame.rem_euclid(frame_end)
    }
}

/// BGRA rows as the orchestrator sends them, top row first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TexturePixels {
    pub width: u32,
    pub height: u32,
    pub bgra: Vec<u8>,
}

impl TexturePixels {
    /// RGBA with rows flipped bottom-up, the layout DCC image buffers expect.
    pub fn to_rgba_flipped(&self) -> Vec<u8> {
        let row_len = self.width as usize * 4;
        if row_len == 0 {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(self.bgra.len());
        for row in self.bgra.chunks_exact(row_len).rev() {
            for pixel in row.chunks_exact(4) {
                out.extend_from_slice(&[pixel[2], pixel[1], pixel[0], pixel[3]]);
            }
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResourceData {
    Texture(TexturePixels),
    Mesh(GeometryPayload),
    Collection(Vec<GeometryPayload>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamResource {
    pub param_id: String,
    pub data: ResourceData,
}

/// An import message together with the resources that follow its JSON text.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportBundle {
    pub message: ImportMessage,
    #[serde(default)]
    pub resources: Vec<ParamResource>,
}

impl ImportBundle {
    pub fn new(message: ImportMessage) -> Self {
        Self {
            message,
            resources: Vec::new(),
        }
    }

    pub fn with_resource(mut self, param_id: impl Into<String>, data: ResourceData) -> Self {
        self.resources.push(ParamResource {
            param_id: param_id.into(),
            data,
        });
        self
    }

    pub fn resource(&self, param_id: &str) -> Option<&ResourceData> {
        self.resources
            .iter()
            .find(|resource| resource.param_id == param_id)
            .map(|resource| &resource.data)
    }

    pub fn encode(&self, writer: &mut Writer<'_>, registry: &GeometryRegistry) -> Result<(), Error> {
        writer.write_text(&self.message.to_json()?)?;
        for param in self.message.params.iter().filter(|param| param.value.has_resource()) {
            let data = self.resource(&param.id).ok_or_else(|| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!(
                        "{} parameter {:?} has no resource attached",
                        param.value.kind(),
                        param.id
                    ))
                    .with_hint("Attach pixels or geometry with `ImportBundle::with_resource`.")
            })?;
            encode_resource(param, data, writer, registry)?;
        }
        Ok(())
    }

    /// An empty text is `Received::Empty`; unparsable JSON is logged and `Received::Discarded`.
    pub fn decode(
        reader: &mut Reader<'_>,
        registry: &GeometryRegistry,
    ) -> Result<Received<ImportBundle>, Error> {
        let text = reader.read_text()?;
        if text.is_empty() {
            return Ok(Received::Empty);
        }
        let message: ImportMessage = match crate::json::parse::from_str(&text) {
            Ok(message) => message,
            Err(err) => {
                let hint = crate::json::parse::hint_for_error(&err, "import.message");
                tracing::warn!(%hint, "discarding unparsable import message");
                return Ok(Received::Discarded(hint));
            }
        };

        let mut resources = Vec::new();
        for param in message.params.iter().filter(|param| param.value.has_resource()) {
            let data = decode_resource(param, reader, registry)?;
            resources.push(ParamResource {
                param_id: param.id.clone(),
                data,
            });
        }
        Ok(Received::Message(ImportBundle { message, resources }))
    }
}

fn encode_resource(
    param: &ImportParam,
    data: &ResourceData,
    writer: &mut Writer<'_>,
    registry: &GeometryRegistry,
) -> Result<(), Error> {
    match (&param.value, data) {
        (ParamValue::Texture { width, height }, ResourceData::Texture(pixels)) => {
            let expected = *width as usize * *height as usize * 4;
            if pixels.bgra.len() != expected {
                return Err(Error::new(ErrorKind::Usage).with_message(format!(
                    "texture {:?} has {} bytes, expected {expected}",
                    param.id,
                    pixels.bgra.len()
                )));
            }
            writer.write_array(&pixels.bgra)
        }
        (ParamValue::Mesh { class }, ResourceData::Mesh(payload)) => {
            registry.encode(class, payload, writer)
        }
        (ParamValue::Collection { count, classes }, ResourceData::Collection(payloads)) => {
            if payloads.len() != *count as usize || classes.len() < payloads.len() {
                return Err(Error::new(ErrorKind::Usage).with_message(format!(
                    "collection {:?} declares {count} objects and {} classes, got {} payloads",
                    param.id,
                    classes.len(),
                    payloads.len()
                )));
            }
            for (class, payload) in classes.iter().zip(payloads) {
                registry.encode(class, payload, writer)?;
            }
            Ok(())
        }
        (value, _) => Err(Error::new(ErrorKind::Usage).with_message(format!(
            "resource for {:?} does not match its {} type",
            param.id,
            value.kind()
        ))),
    }
}

fn decode_resource(
    param: &ImportParam,
    reader: &mut Reader<'_>,
    registry: &GeometryRegistry,
) -> Result<ResourceData, Error> {
    match &param.value {
        ParamValue::Texture { width, height } => {
            let at = reader.position();
            let bgra = reader.read_array::<u8>(4)?;
            let expected = *width as usize * *height as usize * 4;
            if bgra.len() != expected {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message(format!(
                        "texture {:?} carries {} bytes, expected {expected}",
                        param.id,
                        bgra.len()
                    ))
                    .with_offset(at as u64));
            }
            Ok(ResourceData::Texture(TexturePixels {
                width: *width,
                height: *height,
                bgra,
            }))
        }
        ParamValue::Mesh { class } => Ok(ResourceData::Mesh(registry.decode(class, reader)?)),
        ParamValue::Collection { count, classes } => {
            let mut payloads = Vec::with_capacity((*count as usize).min(256));
            for index in 0..*count as usize {
                let class = classes.get(index).ok_or_else(|| {
                    Error::new(ErrorKind::Corrupt).with_message(format!(
                        "collection {:?} has no class for object {index}",
                        param.id
                    ))
                })?;
                payloads.push(registry.decode(class, reader)?);
            }
            Ok(ResourceData::Collection(payloads))
        }
        other => Err(Error::new(ErrorKind::Internal)
            .with_message(format!("{} parameters carry no resource", other.kind()))),
    }
}

mod lenient {
    use serde::de::{Deserializer, Error as _};
    use serde::Deserialize;
    use serde_json::Value;

    pub(super) fn float<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Number(number) => number
                .as_f64()
                .ok_or_else(|| D::Error::custom("number out of range")),
            Value::Bool(flag) => Ok(if flag { 1.0 } else { 0.0 }),
            other => Err(D::Error::custom(format!("expected a number, got {other}"))),
        }
    }

    /// Accepts integers and integral floats such as `3.0`.
    pub(super) fn int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Number(number) => {
                if let Some(value) = number.as_i64() {
                    return Ok(value);
                }
                match number.as_f64() {
                    Some(value) if value.fract() == 0.0 && value.abs() < i64::MAX as f64 => {
                        Ok(value as i64)
                    }
                    _ => Err(D::Error::custom(format!("expected an integer, got {number}"))),
                }
            }
            Value::Bool(flag) => Ok(i64::from(flag)),
            other => Err(D::Error::custom(format!("expected an integer, got {other}"))),
        }
    }

    /// Accepts booleans and numbers, where any non-zero number is true.
    pub(super) fn boolean<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Bool(flag) => Ok(flag),
            Value::Number(number) => Ok(number.as_f64().is_some_and(|value| value != 0.0)),
            other => Err(D::Error::custom(format!("expected a boolean, got {other}"))),
        }
    }

    pub(super) fn dimension<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        let value = int(deserializer)?;
        u32::try_from(value).map_err(|_| D::Error::custom(format!("invalid size {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::geometry::{ASSET_CLASS, MeshInput, TRANSFORM_CLASS};
    use crate::api::export::IDENTITY;
    use serde_json::json;

    fn decode_json(text: &str) -> ImportMessage {
        crate::json::parse::from_str(text).expect("parse")
    }

    #[test]
    fn params_are_discriminated_by_type() {
        let message = decode_json(
            r#"{"Object":"Cube","Frame":10,"Params":[
                {"Id":"Scale","Type":"VALUE","Value":2.5},
                {"Id":"Count","Type":"INT","Value":3.0},
                {"Id":"Flip","Type":"BOOLEAN","Value":1},
                {"Id":"Offset","Type":"VECTOR","Value":[{"X":1,"Y":2,"Z":3}]},
                {"Id":"Tint","Type":"RGBA","Value":[{"R":1,"G":0.5,"B":0,"A":1}]},
                {"Id":"Mode","Type":"MENU","Value":2},
                {"Id":"Mask","Type":"IMAGE","X":2,"Y":1},
                {"Id":"Volume","Type":"VOLUME","Value":null}
            ],"Attributes":[{"AttributeName":"UVMap"}]}"#,
        );

        assert_eq!(message.object, "Cube");
        assert_eq!(message.frame, 10);
        let values: Vec<&ParamValue> = message.params.iter().map(|param| &param.value).collect();
        assert_eq!(values[0], &ParamValue::Value { value: 2.5 });
        assert_eq!(values[1], &ParamValue::Int { value: 3 });
        assert_eq!(values[2], &ParamValue::Boolean { value: true });
        assert_eq!(
            values[3],
            &ParamValue::Vector {
                value: vec![Vector3 {
                    x: 1.0,
                    y: 2.0,
                    z: 3.0
                }]
            }
        );
        assert!(matches!(values[4], ParamValue::Rgba { value } if value[0].g == 0.5));
        assert_eq!(values[5], &ParamValue::Menu { value: 2 });
        assert_eq!(
            values[6],
            &ParamValue::Texture {
                width: 2,
                height: 1
            }
        );
        let ParamValue::Unknown(volume) = values[7] else {
            panic!("expected an unknown param, got {:?}", values[7]);
        };
        assert_eq!(volume.kind, "VOLUME");
        assert_eq!(volume.fields.get("Value"), Some(&Value::Null));
        assert!(!values[7].has_resource());
        assert_eq!(message.attributes[0].name, "UVMap");
    }

    #[test]
    fn unknown_param_types_are_re_encoded_as_received() {
        let param = json!({
            "NodeGroup": "GeometryNodes",
            "Id": "Socket_9",
            "Type": "SHADER",
            "Value": {"Name": "Glass", "Slots": [1, 2]},
            "Label": "Surface"
        });
        let message = decode_json(&json!({"Frame": 1, "Params": [param.clone()]}).to_string());
        assert!(matches!(&message.params[0].value, ParamValue::Unknown(unknown) if unknown.kind == "SHADER"));

        let value: Value = serde_json::from_str(&message.to_json().expect("json")).expect("reparse");
        assert_eq!(value["Params"][0], param);
    }

    #[test]
    fn fractional_int_is_rejected() {
        let result = crate::json::parse::from_str::<ImportMessage>(
            r#"{"Params":[{"Id":"Count","Type":"INT","Value":2.5}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn serialized_params_keep_wire_keys() {
        let message = ImportMessage {
            object: String::new(),
            frame: 10,
            params: vec![ImportParam::new("Scale", ParamValue::Value { value: 2.5 })],
            attributes: Vec::new(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&message.to_json().expect("json")).expect("reparse");
        assert_eq!(
            value["Params"][0],
            json!({"Id": "Scale", "Type": "VALUE", "Value": 2.5})
        );
        assert_eq!(value["Frame"], json!(10));
    }

    #[test]
    fn node_group_filter_matches_none_and_absent() {
        let mut param = ImportParam::new("Scale", ParamValue::Value { value: 1.0 });
        assert!(param.applies_to("GeometryNodes"));
        param.node_group = Some("None".to_string());
        assert!(param.applies_to("GeometryNodes"));
        param.node_group = Some("Other".to_string());
        assert!(!param.applies_to("GeometryNodes"));
    }

    #[test]
    fn texture_pixels_become_bottom_up_rgba() {
        let pixels = TexturePixels {
            width: 1,
            height: 2,
            bgra: vec![10, 20, 30, 255, 1, 2, 3, 128],
        };
        assert_eq!(pixels.to_rgba_flipped(), vec![3, 2, 1, 128, 30, 20, 10, 255]);
    }

    #[test]
    fn frame_wraps_into_scene_range() {
        let message = ImportMessage {
            frame: 260,
            ..ImportMessage::default()
        };
        assert_eq!(message.wrapped_frame(250), 10);
        assert_eq!(message.wrapped_frame(0), 260);
    }

    #[test]
    fn resources_follow_the_json_in_param_order() {
        let registry = GeometryRegistry::default();
        let mesh = MeshInput {
            positions: vec![[0.0, 0.0, 0.0]; 3],
            normals: vec![[0.0, 0.0, 1.0]; 3],
            indices: vec![0, 1, 2],
            uvs: vec![[0.0, 0.0]; 3],
            material_indices: vec![0],
            transform: IDENTITY,
            asset_path_id: 7,
        };
        let message = ImportMessage {
            object: "Cube".to_string(),
            frame: 1,
            params: vec![
                ImportParam::new(
                    "Mask",
                    ParamValue::Texture {
                        width: 1,
                        height: 1,
                    },
                ),
                ImportParam::new("Scale", ParamValue::Value { value: 1.0 }),
                ImportParam::new(
                    "Rocks",
                    ParamValue::Collection {
                        count: 2,
                        classes: vec![ASSET_CLASS.to_string(), TRANSFORM_CLASS.to_string()],
                    },
                ),
            ],
            attributes: Vec::new(),
        };
        let bundle = ImportBundle::new(message)
            .with_resource(
                "Rocks",
                ResourceData::Collection(vec![
                    GeometryPayload::Mesh(mesh),
                    GeometryPayload::Transform(IDENTITY),
                ]),
            )
            .with_resource(
                "Mask",
                ResourceData::Texture(TexturePixels {
                    width: 1,
                    height: 1,
                    bgra: vec![1, 2, 3, 4],
                }),
            );

        let mut buf = vec![0u8; 8192];
        let mut writer = Writer::new(&mut buf);
        bundle.encode(&mut writer, &registry).expect("encode");
        let len = writer.position();

        let mut reader = Reader::new(&buf[..len]);
        let Received::Message(decoded) = ImportBundle::decode(&mut reader, &registry).expect("decode")
        else {
            panic!("expected a message");
        };
        assert!(reader.is_exhausted());
        assert_eq!(decoded.message, bundle.message);
        assert_eq!(decoded.resource("Mask"), bundle.resource("Mask"));
        assert_eq!(decoded.resource("Rocks"), bundle.resource("Rocks"));
        assert_eq!(decoded.resources[0].param_id, "Mask");
    }

    #[test]
    fn missing_resource_is_a_usage_error() {
        let message = ImportMessage {
            params: vec![ImportParam::new(
                "Target",
                ParamValue::Mesh {
                    class: ASSET_CLASS.to_string(),
                },
            )],
            ..ImportMessage::default()
        };
        let mut buf = vec![0u8; 1024];
        let err = ImportBundle::new(message)
            .encode(&mut Writer::new(&mut buf), &GeometryRegistry::default())
            .expect_err("no resource");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn empty_and_malformed_text() {
        let registry = GeometryRegistry::default();
        let mut buf = vec![0u8; 256];
        let mut writer = Writer::new(&mut buf);
        writer.write_text("").expect("empty");
        writer.write_text("{\"Frame\":").expect("broken");
        let len = writer.position();

        let mut reader = Reader::new(&buf[..len]);
        assert_eq!(
            ImportBundle::decode(&mut reader, &registry).expect("empty"),
            Received::Empty
        );
        match ImportBundle::decode(&mut reader, &registry).expect("discarded") {
            Received::Discarded(hint) => assert!(hint.contains("truncated")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
