pub mod classifier;
pub mod decision;
pub mod detector;
pub mod private_net;
