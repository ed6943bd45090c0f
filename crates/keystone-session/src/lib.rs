//! Keystone session layer
//!
//! Concurrency control on top of `keystone-core`:
//!
//! - **Exclusive mode**: one session may lock the database; new connections
//!   are rejected, statements from existing sessions wait
//! - **Result cache**: repeated execution of an unchanged prepared statement
//!   returns the captured rows until any write advances the modification
//!   generation
//! - **Commit path**: journal first, then apply, then bump the generation
//!
//! # Usage
//!
//! ```no_run
//! use keystone_core::Config;
//! use keystone_session::{Database, PreparedStatement, Value};
//!
//! let db = Database::open("/tmp/keystone-demo", Config::default())?;
//! let session = db.connect()?;
//! let stmt = PreparedStatement::prepare("SELECT 1");
//! let rows = session.execute_query(&stmt, || Ok(vec![vec![Value::Int(1)]]))?;
//! assert_eq!(rows.len(), 1);
//! # Ok::<(), keystone_core::StorageError>(())
//! ```

pub mod database;
pub mod exclusive;
pub mod result_cache;
pub mod session;
pub mod settings;
pub mod statement;
pub mod value;

pub use database::Database;
pub use exclusive::{ExclusiveModeController, ExclusiveState};
pub use result_cache::{CacheStats, ResultCache};
pub use session::Session;
pub use settings::Setting;
pub use statement::{Fingerprint, NonDeterministic, PreparedStatement};
pub use value::{Row, Rows, Value};
