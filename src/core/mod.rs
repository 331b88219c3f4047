pub mod assistant;
pub mod automation;
pub mod catalogue;
pub mod executor;
pub mod handlers;
pub mod intent;
pub mod journal;
pub mod matcher;
pub mod params;
pub mod sandbox;
