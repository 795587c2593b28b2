//! Git workspace and release lifecycle engine for itemflow work items.

pub mod behavior;
pub mod branch;
pub mod config;
pub mod done;
pub mod error;
pub mod git;
pub mod github;
pub mod item;
pub mod polyrepo;
pub mod pr;
pub mod runner;
pub mod setup;
pub mod start;
pub mod status;
pub mod worktree;

pub use error::FlowError;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}


#[cfg(test)]
mod tests {
    use super::version;

    #[test]
    fn version_is_not_empty() {
        assert!(!version().is_empty());
    }
}
