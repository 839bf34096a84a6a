//! Host mutations: config reconcilers, certificates, DNS, process and unit
//! control, and the site and deployment orchestration built on them.

pub mod audit;
pub mod certificates;
pub mod control;
pub mod deployments;
pub mod dns;
pub mod installer;
pub mod nginx;
pub mod php_fpm;
pub mod pipeline;
pub mod pm2;
mod reconcile;
pub mod units;
pub mod websites;

pub use audit::Auditor;
pub use certificates::{CertificateError, CertificateManager};
pub use control::ControlService;
pub use deployments::{DeployTarget, DeploymentRunner};
pub use dns::{CloudflareClient, DnsError, DnsSyncEngine, HttpIpResolver};
pub use installer::ConfigInstaller;
pub use nginx::NginxReconciler;
pub use php_fpm::PhpFpmReconciler;
pub use pm2::{Pm2Controller, Pm2Process};
pub use units::{UnitLifecycle, UnitService};
pub use websites::{Pm2Action, WebsiteComponents, WebsiteService};
