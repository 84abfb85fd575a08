//! Purpose: Define the stable public Rust API boundary for AlterMesh.
//! Exports: Session handles, lock types, typed messages, and the geometry registry.
//! Role: Public, additive-only surface used by the CLI, the C ABI, and embedders.
//! Invariants: This module is the only public path to segment and lock primitives.
//! Invariants: Wire layouts live with their message types, not in callers.

mod export;
mod geometry;
mod import;
mod message;
mod params;

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::codec::{Reader, Scalar, Writer};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::lock::{LockPolicy, LockState, Side};
pub use crate::core::segment::{DEFAULT_SEGMENT_SIZE, HEADER_SIZE};
pub use crate::core::session::{
    DEFAULT_DRAIN, ReadBracket, Session, SessionInfo, SessionOptions, SessionTokens, WriteBracket,
};
pub use export::{
    AttributeDomain, AttributeType, ExportMessage, HostVersion, IDENTITY, InstanceData,
    MeshAttribute, MeshData,
};
pub use geometry::{
    ACTOR_CLASS, ASSET_CLASS, ActorInput, DecodeFn, EncodeFn, GeometryCodec, GeometryPayload,
    GeometryRegistry, LANDSCAPE_CLASS, MeshInput, PARTICLE_DATA_CLASS, SPLINE_CLASS, SplineInput,
    TRANSFORM_CLASS,
};
pub use import::{
    AttributeRequest, ImportBundle, ImportMessage, ImportParam, ParamResource, ParamValue,
    ResourceData, Rgba, TexturePixels, UnknownParam, Vector3,
};
pub use message::{Received, SessionMessageExt};
pub use params::{
    GeometryDefault, ParamDescriptor, ParamSpec, ParamsDocument, ParamsMessage, ParamsObject,
};
