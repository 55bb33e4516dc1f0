//! Controller wire protocol: parameter catalogue, frames and the line codec.

pub mod codec;
pub mod frame;
pub mod registry;

pub use codec::{FrameCodec, FrameLimits, SNAPSHOT_COMMAND};
pub use frame::{Frame, TelemetryPoint};
pub use registry::{
    ConfirmationPolicy, EncodingBase, ParameterClass, ParameterRegistry, ParameterSpec,
    ValidatedCommand,
};
