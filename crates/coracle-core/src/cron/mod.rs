pub mod service;
pub mod types;

pub use service::CronService;
pub use types::{CronJob, CronJobState, CronPayload, CronSchedule, CronStore, ScheduleKind};
