//! CardForge Core - Card Production Orchestrator
//!
//! # Operating Rules
//! 1. The Ledger Is Truth (counts are derived, never cached)
//! 2. Every Transition Is Durable Before The Next Phase
//! 3. Collaborators Suggest, The Gate Decides
//! 4. Templates Are Contracts
//! 5. Sync Only What Changed, Wire Only What Is Complete

pub mod model;
pub mod hashing;
pub mod config;
pub mod telemetry;
pub mod retry;
pub mod collaborators;
pub mod templates;
pub mod validation;
pub mod artifacts;
pub mod ledger;
pub mod reference;
pub mod scheduler;
pub mod composite;
pub mod gate;
pub mod controller;
pub mod runner;
pub mod sync;

pub use model::{CardContent, CardType, Category, Item, ItemFilter, Phase, Rarity, Seq};
pub use config::{ConfigError, ForgeConfig};
pub use collaborators::{
    CollaboratorError, ErrorClass, ImageGenerator, QualityJudge, RemoteCatalog, TextGenerator,
};
pub use ledger::{Ledger, LedgerError, LedgerSnapshot};
pub use reference::{ReferenceSelector, ReferenceSet};
pub use scheduler::Scheduler;
pub use gate::{Deficiency, GradeResult, QualityGate};
pub use controller::{Collaborators, ControllerError, ItemReport, PhaseController};
pub use runner::{CancelFlag, RunReport, Runner};
pub use sync::{SyncError, SyncProtocol, SyncReport};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
