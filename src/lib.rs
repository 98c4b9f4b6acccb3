// Packline Library - PackML Machine State Coordination
// This exposes the state model, the engine, and the fleet coordination layer

pub mod config;
pub mod coordination;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod state;
pub mod telemetry;

// Re-export key types for easy access
pub use config::{config, init_config, PacklineConfig};
pub use coordination::{
    Coordinator, CoordinatorSettings, FollowFleet, MirrorDelegate, NodeMirror, TransitionAck,
    Transport,
};
pub use engine::{Engine, EngineBuilder, WorkFn};
pub use errors::{CommandError, CommandOutcome, CoordinationError, TransportError};
pub use observability::{
    coordination_metrics, create_fan_out_span, engine_metrics, CoordinationMetrics, EngineMetrics,
    OperationTimer,
};
pub use state::{
    CycleMode, ModeProfile, ModeType, State, Status, SuperState, TransitionCmd,
};
pub use telemetry::{
    create_coordination_span, generate_correlation_id, init_telemetry, shutdown_telemetry,
};
