//! Purpose: Geometry payloads carried by MESH and COLLECTION import parameters.
//! Exports: `GeometryRegistry`, `GeometryCodec`, `GeometryPayload`, `MeshInput`, `SplineInput`, `ActorInput`.
//! Role: Maps an orchestrator class name to the codec that reads or writes its frames.
//! Invariants: Resolution happens at decode time; an unknown class is a structural error.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::codec::{Reader, Writer};
use crate::core::error::{Error, ErrorKind};

pub const ASSET_CLASS: &str = "AlterMeshGeometryAsset";
pub const LANDSCAPE_CLASS: &str = "AlterMeshGeometryLandscape";
pub const SPLINE_CLASS: &str = "AlterMeshGeometrySpline";
pub const ACTOR_CLASS: &str = "AlterMeshGeometryActor";
pub const TRANSFORM_CLASS: &str = "AlterMeshGeometryTransform";
pub const PARTICLE_DATA_CLASS: &str = "AlterMeshGeometryParticleData";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshInput {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub indices: Vec<i32>,
    pub uvs: Vec<[f32; 2]>,
    pub material_indices: Vec<i32>,
    pub transform: [f32; 16],
    pub asset_path_id: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SplineInput {
    pub resolution: i32,
    pub cyclic: bool,
    pub locations: Vec<[f32; 3]>,
    pub scales: Vec<[f32; 3]>,
    pub rolls: Vec<f32>,
    pub leave_tangents: Vec<[f32; 3]>,
    pub arrive_tangents: Vec<[f32; 3]>,
    pub point_types: Vec<i32>,
}

/// An actor is sent as its spline components, or as a mesh when it has none.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ActorInput {
    Splines(Vec<SplineInput>),
    Mesh(MeshInput),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GeometryPayload {
    Mesh(MeshInput),
    Spline(SplineInput),
    Actor(ActorInput),
    Transform([f32; 16]),
    Particles(Vec<[f32; 3]>),
}

impl GeometryPayload {
    fn kind(&self) -> &'static str {
        match self {
            GeometryPayload::Mesh(_) => "mesh",
            GeometryPayload::Spline(_) => "spline",
            GeometryPayload::Actor(_) => "actor",
            GeometryPayload::Transform(_) => "transform",
            GeometryPayload::Particles(_) => "particles",
        }
    }
}

pub type DecodeFn = fn(&mut Reader<'_>) -> Result<GeometryPayload, Error>;
pub type EncodeFn = fn(&GeometryPayload, &mut Writer<'_>) -> Result<(), Error>;

#[derive(Clone, Copy)]
pub struct GeometryCodec {
    pub decode: DecodeFn,
    pub encode: EncodeFn,
}

#[derive(Clone)]
pub struct GeometryRegistry {
    codecs: BTreeMap<String, GeometryCodec>,
}

impl GeometryRegistry {
    /// A registry with no classes; see `Default` for the built-in set.
    pub fn empty() -> Self {
        Self {
            codecs: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, class: impl Into<String>, codec: GeometryCodec) {
        self.codecs.insert(class.into(), codec);
    }

    pub fn contains(&self, class: &str) -> bool {
        self.codecs.contains_key(class)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.codecs.keys().map(String::as_str)
    }

    pub fn decode(&self, class: &str, reader: &mut Reader<'_>) -> Result<GeometryPayload, Error> {
        let codec = self.lookup(class, reader.position())?;
        (codec.decode)(reader)
    }

    pub fn encode(
        &self,
        class: &str,
        payload: &GeometryPayload,
        writer: &mut Writer<'_>,
    ) -> Result<(), Error> {
        let codec = self.lookup(class, writer.position())?;
        (codec.encode)(payload, writer)
    }

    fn lookup(&self, class: &str, offset: usize) -> Result<GeometryCodec, Error> {
        self.codecs.get(class).copied().ok_or_else(|| {
            Error::new(ErrorKind::Corrupt)
                .with_message(format!("unknown geometry class {class:?}"))
                .with_offset(offset as u64)
        })
    }
}

impl Default for GeometryRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        let mesh = GeometryCodec {
            decode: |reader| decode_mesh(reader).map(GeometryPayload::Mesh),
            encode: |payload, writer| match payload {
                GeometryPayload::Mesh(mesh) => encode_mesh(mesh, writer),
                other => Err(payload_mismatch("mesh", other)),
            },
        };
        registry.register(ASSET_CLASS, mesh);
        registry.register(LANDSCAPE_CLASS, mesh);
        registry.register(
            SPLINE_CLASS,
            GeometryCodec {
                decode: |reader| decode_spline(reader).map(GeometryPayload::Spline),
                encode: |payload, writer| match payload {
                    GeometryPayload::Spline(spline) => encode_spline(spline, writer),
                    other => Err(payload_mismatch("spline", other)),
                },
            },
        );
        registry.register(
            ACTOR_CLASS,
            GeometryCodec {
                decode: decode_actor,
                encode: encode_actor,
            },
        );
        registry.register(
            TRANSFORM_CLASS,
            GeometryCodec {
                decode: |reader| Ok(GeometryPayload::Transform(reader.read_fixed()?)),
                encode: |payload, writer| match payload {
                    GeometryPayload::Transform(matrix) => writer.write_fixed(matrix),
                    other => Err(payload_mismatch("transform", other)),
                },
            },
        );
        registry.register(
            PARTICLE_DATA_CLASS,
            GeometryCodec {
                decode: |reader| Ok(GeometryPayload::Particles(reader.read_rows()?)),
                encode: |payload, writer| match payload {
                    GeometryPayload::Particles(points) => writer.write_rows(points),
                    other => Err(payload_mismatch("particles", other)),
                },
            },
        );
        registry
    }
}

fn payload_mismatch(expected: &str, payload: &GeometryPayload) -> Error {
    Error::new(ErrorKind::Usage).with_message(format!(
        "expected a {expected} payload, got {}",
        payload.kind()
    ))
}

fn encode_mesh(mesh: &MeshInput, writer: &mut Writer<'_>) -> Result<(), Error> {
    writer.write_rows(&mesh.positions)?;
    writer.write_rows(&mesh.normals)?;
    writer.write_array(&mesh.indices)?;
    writer.write_rows(&mesh.uvs)?;
    writer.write_array(&mesh.material_indices)?;
    writer.write_fixed(&mesh.transform)?;
    writer.write_value(mesh.asset_path_id)
}

fn decode_mesh(reader: &mut Reader<'_>) -> Result<MeshInput, Error> {
    Ok(MeshInput {
        positions: reader.read_rows()?,
        normals: reader.read_rows()?,
        indices: reader.read_array(3)?,
        uvs: reader.read_rows()?,
        material_indices: reader.read_array(1)?,
        transform: reader.read_fixed()?,
        asset_path_id: reader.read_value()?,
    })
}

fn encode_spline(spline: &SplineInput, writer: &mut Writer<'_>) -> Result<(), Error> {
    writer.write_value(spline.resolution)?;
    writer.write_value(spline.cyclic)?;
    writer.write_rows(&spline.locations)?;
    writer.write_rows(&spline.scales)?;
    writer.write_array(&spline.rolls)?;
    writer.write_rows(&spline.leave_tangents)?;
    writer.write_rows(&spline.arrive_tangents)?;
    writer.write_array(&spline.point_types)
}

fn decode_spline(reader: &mut Reader<'_>) -> Result<SplineInput, Error> {
    Ok(SplineInput {
        resolution: reader.read_value()?,
        cyclic: reader.read_value()?,
        locations: reader.read_rows()?,
        scales: reader.read_rows()?,
        rolls: reader.read_array(1)?,
        leave_tangents: reader.read_rows()?,
        arrive_tangents: reader.read_rows()?,
        point_types: reader.read_array(1)?,
    })
}

fn encode_actor(payload: &GeometryPayload, writer: &mut Writer<'_>) -> Result<(), Error> {
    match payload {
        GeometryPayload::Actor(ActorInput::Splines(splines)) if !splines.is_empty() => {
            let count = i32::try_from(splines.len()).map_err(|_| {
                Error::new(ErrorKind::Usage).with_message("too many splines in actor")
            })?;
            writer.write_value(count)?;
            for spline in splines {
                encode_spline(spline, writer)?;
            }
            Ok(())
        }
        GeometryPayload::Actor(ActorInput::Splines(_)) => Err(Error::new(ErrorKind::Usage)
            .with_message("an actor without splines must be sent as a mesh")),
        GeometryPayload::Actor(ActorInput::Mesh(mesh)) => {
            writer.write_value(0i32)?;
            encode_mesh(mesh, writer)
        }
        other => Err(payload_mismatch("actor", other)),
    }
}

fn decode_actor(reader: &mut Reader<'_>) -> Result<GeometryPayload, Error> {
    let spline_count = crate::api::export::read_count(reader, "spline")?;
    let actor = if spline_count > 0 {
        let mut splines = Vec::with_capacity(spline_count.min(256));
        for _ in 0..spline_count {
            splines.push(decode_spline(reader)?);
        }
        ActorInput::Splines(splines)
    } else {
        ActorInput::Mesh(decode_mesh(reader)?)
    };
    Ok(GeometryPayload::Actor(actor))
}
