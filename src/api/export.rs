//! Purpose: The export message: evaluated meshes and their instances, plugin to host.
//! Exports: `ExportMessage`, `MeshData`, `InstanceData`, `HostVersion`, `MeshAttribute`, `AttributeType`, `AttributeDomain`.
//! Role: Fixes the field order of the export wire sequence for both endpoints.
//! Invariants: Attribute arrays are always four `f32` components per element.
//! Invariants: The decoder must be told how many attributes were requested.

use serde::{Deserialize, Serialize};

use crate::core::codec::{Reader, Writer};
use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct HostVersion {
    pub major: i32,
    pub minor: i32,
    pub patch: i32,
}

impl HostVersion {
    pub fn new(major: i32, minor: i32, patch: i32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

/// Source element types a DCC attribute may have before it is widened to vec4.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributeType {
    Float,
    Int,
    FloatVector,
    Boolean,
    Float2,
    Int8,
    #[serde(rename = "INT32_2D")]
    Int32x2,
    FloatColor,
    ByteColor,
}

impl AttributeType {
    pub fn components(self) -> usize {
        match self {
            AttributeType::Float
            | AttributeType::Int
            | AttributeType::Boolean
            | AttributeType::Int8 => 1,
            AttributeType::Float2 | AttributeType::Int32x2 => 2,
            AttributeType::FloatVector => 3,
            AttributeType::FloatColor | AttributeType::ByteColor => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttributeDomain {
    Point,
    Corner,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeshAttribute {
    pub values: Vec<[f32; 4]>,
    pub point_domain: bool,
}

impl MeshAttribute {
    /// Widens `raw` (rows of `ty.components()` values) to vec4, zero-padding the tail.
    pub fn from_components(
        ty: AttributeType,
        domain: AttributeDomain,
        raw: &[f32],
    ) -> Result<Self, Error> {
        let components = ty.components();
        if raw.len() % components != 0 {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "attribute data of {} values is not a multiple of {components}",
                raw.len()
            )));
        }
        let values = raw
            .chunks_exact(components)
            .map(|row| {
                let mut out = [0.0f32; 4];
                out[..components].copy_from_slice(row);
                out
            })
            .collect();
        Ok(Self {
            values,
            point_domain: domain == AttributeDomain::Point,
        })
    }

    /// Stand-in for a requested attribute the mesh does not have.
    pub fn missing(vertex_count: usize) -> Self {
        Self {
            values: vec![[0.0; 4]; vertex_count],
            point_domain: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshData {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub triangle_indices: Vec<[i32; 3]>,
    pub triangle_loop_indices: Vec<[i32; 3]>,
    pub loop_vertex_indices: Vec<i32>,
    pub material_index_per_triangle: Vec<i32>,
    pub material_names: Vec<String>,
    pub identity_hash: i64,
    pub host_version: HostVersion,
    #[serde(default)]
    pub attributes: Vec<MeshAttribute>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceData {
    pub asset_path_id: u64,
    pub local_transform: [f32; 16],
    pub world_transform: [f32; 16],
    pub mesh_identity_hash: i64,
}

pub const IDENTITY: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportMessage {
    pub meshes: Vec<MeshData>,
    pub instances: Vec<InstanceData>,
}

#[derive(Serialize, Deserialize)]
struct MaterialList {
    #[serde(rename = "Materials")]
    materials: Vec<String>,
}

impl ExportMessage {
    /// Number of attributes every mesh carries; meshes must agree.
    pub fn attribute_count(&self) -> Result<usize, Error> {
        let count = self.meshes.first().map_or(0, |mesh| mesh.attributes.len());
        if self.meshes.iter().any(|mesh| mesh.attributes.len() != count) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("meshes carry different attribute counts"));
        }
        Ok(count)
    }

    pub fn encode(&self, writer: &mut Writer<'_>) -> Result<(), Error> {
        self.attribute_count()?;
        writer.write_value(count_i32(self.meshes.len())?)?;
        writer.write_value(count_i32(self.instances.len())?)?;
        for mesh in &self.meshes {
            encode_mesh(mesh, writer)?;
        }
        for instance in &self.instances {
            writer.write_value(instance.asset_path_id)?;
            writer.write_fixed(&instance.local_transform)?;
            writer.write_fixed(&instance.world_transform)?;
            writer.write_value(instance.mesh_identity_hash)?;
        }
        Ok(())
    }

    pub fn decode(reader: &mut Reader<'_>, attribute_count: usize) -> Result<Self, Error> {
        let mesh_count = read_count(reader, "mesh")?;
        let instance_count = read_count(reader, "instance")?;
        let mut meshes = Vec::with_capacity(mesh_count.min(1024));
        for _ in 0..mesh_count {
            meshes.push(decode_mesh(reader, attribute_count)?);
        }
        let mut instances = Vec::with_capacity(instance_count.min(1024));
        for _ in 0..instance_count {
            instances.push(InstanceData {
                asset_path_id: reader.read_value()?,
                local_transform: reader.read_fixed()?,
                world_transform: reader.read_fixed()?,
                mesh_identity_hash: reader.read_value()?,
            });
        }
        Ok(Self { meshes, instances })
    }
}

fn encode_mesh(mesh: &MeshData, writer: &mut Writer<'_>) -> Result<(), Error> {
    writer.write_rows(&mesh.positions)?;
    writer.write_rows(&mesh.normals)?;
    writer.write_rows(&mesh.triangle_indices)?;
    writer.write_rows(&mesh.triangle_loop_indices)?;
    writer.write_array(&mesh.loop_vertex_indices)?;
    writer.write_array(&mesh.material_index_per_triangle)?;
    let names = serde_json::to_string(&MaterialList {
        materials: mesh.material_names.clone(),
    })
    .map_err(|err| Error::new(ErrorKind::Internal).with_source(err))?;
    writer.write_text(&names)?;
    writer.write_value(mesh.identity_hash)?;
    let version = mesh.host_version;
    writer.write_fixed(&[version.major, version.minor, version.patch])?;
    let mut point_domain = Vec::with_capacity(mesh.attributes.len());
    for attribute in &mesh.attributes {
        writer.write_rows(&attribute.values)?;
        point_domain.push(attribute.point_domain);
    }
    writer.write_array(&point_domain)
}

fn decode_mesh(reader: &mut Reader<'_>, attribute_count: usize) -> Result<MeshData, Error> {
    let positions = reader.read_rows()?;
    let normals = reader.read_rows()?;
    let triangle_indices = reader.read_rows()?;
    let triangle_loop_indices = reader.read_rows()?;
    let loop_vertex_indices = reader.read_array(1)?;
    let material_index_per_triangle = reader.read_array(1)?;

    let names_at = reader.position();
    let names = reader.read_text()?;
    let material_names = crate::json::parse::from_str::<MaterialList>(&names)
        .map_err(|err| {
            Error::new(ErrorKind::Decode)
                .with_message("material name list is not valid JSON")
                .with_hint(crate::json::parse::hint_for_error(&err, "export.materials"))
                .with_offset(names_at as u64)
        })?
        .materials;

    let identity_hash = reader.read_value()?;
    let [major, minor, patch] = reader.read_fixed::<i32, 3>()?;

    let mut values = Vec::with_capacity(attribute_count);
    for _ in 0..attribute_count {
        values.push(reader.read_rows::<f32, 4>()?);
    }
    let mask_at = reader.position();
    let point_domain = reader.read_array::<bool>(1)?;
    if point_domain.len() != attribute_count {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message(format!(
                "attribute domain mask has {} entries, expected {attribute_count}",
                point_domain.len()
            ))
            .with_offset(mask_at as u64));
    }
    let attributes = values
        .into_iter()
        .zip(point_domain)
        .map(|(values, point_domain)| MeshAttribute {
            values,
            point_domain,
        })
        .collect();

    Ok(MeshData {
        positions,
        normals,
        triangle_indices,
        triangle_loop_indices,
        loop_vertex_indices,
        material_index_per_triangle,
        material_names,
        identity_hash,
        host_version: HostVersion::new(major, minor, patch),
        attributes,
    })
}

pub(crate) fn count_i32(len: usize) -> Result<i32, Error> {
    i32::try_from(len)
        .map_err(|_| Error::new(ErrorKind::Usage).with_message(format!("count {len} exceeds i32")))
}

pub(crate) fn read_count(reader: &mut Reader<'_>, what: &str) -> Result<usize, Error> {
    let at = reader.position();
    let count = reader.read_value::<i32>()?;
    usize::try_from(count).map_err(|_| {
        Error::new(ErrorKind::Corrupt)
            .with_message(format!("negative {what} count {count}"))
            .with_offset(at as u64)
    })
}
