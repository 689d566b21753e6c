//! Domain model shared across the gateway.
//!
//! # Purpose
//! Defines project records, the typed metadata bag, notification rules, and
//! device rows. Database row shapes live with the stores; these are the
//! types the rest of the gateway speaks.

mod device;
mod event;
mod metadata;
mod project;
mod rule;

pub use device::{DevicePlatform, UserDevice};
pub use event::ChangeEvent;
pub use metadata::{
    AllowedOrigin, FcmServiceAccount, PoolSizing, ProjectMetadata, PushCredentials,
    SecuritySettings, WebhookConfig,
};
pub use project::{PoolTarget, Project, ProjectSecrets, ProjectStatus};
pub use rule::{ConditionOp, NotificationRule, RuleCondition, RuleEvent};
