//! # Media Job Engine Library
//!
//! Questo è il modulo principale della libreria che espone tutte le API pubbliche.
//!
//! ## Responsabilità:
//! - Definisce la struttura modulare del motore dei job
//! - Espone i tipi e le funzioni principali tramite re-exports
//! - Fornisce un'interfaccia pulita per il main.rs e per altri front-end
//!
//! ## Architettura dei moduli:
//! - `config`: Configurazione del motore e validazione
//! - `error`: Tassonomia degli errori dei job
//! - `operation`: Operazioni tipizzate e validazione parametri
//! - `job`: Richieste, record dei job e macchina a stati
//! - `file_manager`: Ispezione degli input e dimensioni
//! - `workspace`: Directory di lavoro per job, quote e sweep orfani
//! - `invoker`: Esecuzione dei tool esterni e mappatura operazione → invocazioni
//! - `scheduler`: Coda FIFO con fairness per utente e worker
//! - `tracker`: Indice dei job, progresso e storico
//! - `publisher`: Consegna esattamente-una-volta dei risultati
//! - `audit`: Log JSON-lines dei job terminati
//! - `engine`: Facciata `MediaJobEngine`
//! - `platform`: Risoluzione cross-platform degli eseguibili
//! - `progress`: Barra di avanzamento per la CLI
//!
//! ## Utilizzo:
//! ```ignore
//! use media_job_engine::{ChannelSink, EngineConfig, MediaJobEngine, OperationKind, ProcessRunner, UserId};
//!
//! let (sink, mut results) = ChannelSink::new();
//! let engine = MediaJobEngine::start(EngineConfig::default(), Arc::new(ProcessRunner::new()), Arc::new(sink)).await?;
//! let job_id = engine.submit_job(OperationKind::Thumbnail, vec![path], params, UserId::from(1)).await?;
//! ```

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod file_manager;
pub mod invoker;
pub mod job;
pub mod operation;
pub mod platform;
pub mod progress;
pub mod publisher;
pub mod scheduler;
pub mod tracker;
pub mod utils;
pub mod workspace;

pub use config::EngineConfig;
pub use engine::MediaJobEngine;
pub use error::{JobError, JobResult};
pub use invoker::{ProcessRunner, ToolInvocation, ToolOutput, ToolRunner};
pub use job::{Job, JobId, JobRequest, JobState, JobStatus, Transition, UserId};
pub use operation::{Operation, OperationKind};
pub use publisher::{ChannelSink, DirectorySink, JobNotice, ResultSink};
