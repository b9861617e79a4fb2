pub mod artifact;
pub mod deployment;
pub mod device_deployment;
pub mod poll;

pub use artifact::*;
pub use deployment::*;
pub use device_deployment::*;
pub use poll::*;
