pub mod load_balancer;
pub mod upstream;

pub use load_balancer::{Balancer, FlightGuard, Selection};
pub use upstream::{HealthCheckSettings, Node, NodeGroup, NodeKey, Router};
