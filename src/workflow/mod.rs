//! Workflow sequencing: the FIFO scheduler, the concurrent-start primitive
//! and the imaging/treatment sequences built on them.

pub mod operations;
pub mod scheduler;
pub mod sync;

pub use operations::{Beamline, ImagingPlan, ImagingSettings, Notifier, TreatmentPort};
pub use scheduler::{
    CancelHandle, CompletionTrigger, Step, TriggerOutcome, WorkflowEvent, WorkflowItem,
    WorkflowScheduler, WorkflowSettings,
};
pub use sync::{sync_task, synchronize, SyncReport, SyncTask, TaskReport};
