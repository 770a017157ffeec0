pub mod cron;
pub mod engine;
pub mod rrule_eval;
pub mod schedule;

pub use cron::{next_cron_occurrence, CronError, CronExpr};
pub use engine::{
    NoTopicBridge, NoopTaskRunNotifier, TaskEngine, TaskEngineConfig, TaskRunNotifier, TopicBridge,
    TOPICS_UNAVAILABLE,
};
pub use rrule_eval::next_rrule_occurrence;
pub use schedule::{compute_next_occurrence, validate_timezone, ScheduleError, ScheduleSpec};
