pub mod aggregation;
pub mod batch;
pub mod directory;
pub mod gateway;
pub mod load;
pub mod session;
pub mod store;
pub mod tags;
pub mod threshold;

#[cfg(test)]
mod fake_api;
#[cfg(test)]
mod fake_redis;
