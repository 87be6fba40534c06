//! Typed ID definitions for deployment resources.

use crate::define_id;

define_id!(
    /// A deployable application.
    ApplicationId,
    "app"
);

define_id!(
    /// One orchestration attempt for an application.
    DeploymentId,
    "dep"
);

define_id!(
    /// A CPU/memory reservation held in the resource ledger.
    ReservationId,
    "rsv"
);

define_id!(
    /// A delayed background task.
    TaskId,
    "task"
);
