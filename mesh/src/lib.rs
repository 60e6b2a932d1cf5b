pub mod adapter;
pub mod simulator;

pub use adapter::{create_adapter, MeshAdapter};
pub use simulator::SimulatorAdapter;
