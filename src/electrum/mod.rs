pub mod api;
pub mod client;
pub mod mock_client;
pub mod types;

pub use api::ElectrumConnection;
pub use client::ElectrumClient;
pub use mock_client::MockElectrumClient;
