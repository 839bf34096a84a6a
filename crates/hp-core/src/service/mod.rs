//! Daemon control through systemd for a fixed catalog of units.

mod catalog;
mod fanout;
mod manager;
mod status;

pub use catalog::{debian_units, php_fpm_key, rhel_units, KnownUnit, OsFamily};
pub use fanout::fan_out;
pub use manager::{
    service_manager_for, DebianServiceManager, ManagerOptions, RhelServiceManager,
    ServiceAction, ServiceError, ServiceManager, UnitStatus,
};
pub use status::{parse_ps_usage, parse_systemctl_status, ParsedStatus, UnitState};
