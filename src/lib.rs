//! # thread-triage
//!
//! Chat thread labeling, review, and answer retrieval over a message archive.
//!
//! thread-triage ingests chat messages from a rooms-style messaging API,
//! labels conversation threads ("question" / "answer" / "clarification")
//! through an external LLM classifier, builds a similarity index over
//! thread-root embeddings, and serves a review API plus a query assistant
//! that answers new questions from previously solved threads.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │  Connector   │──▶│ Embed + Index │──▶│  SQLite   │
//! │  rooms API   │   │  + Labeler    │   │ + index   │
//! └─────────────┘   └──────────────┘   └────┬─────┘
//!                                           │
//!                       ┌───────────────────┤
//!                       ▼                   ▼
//!                  ┌──────────┐       ┌──────────┐
//!                  │   CLI    │       │   HTTP   │
//!                  │ (triage) │       │ (review) │
//!                  └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! triage init                     # create database
//! triage sync rooms               # ingest configured rooms
//! triage embed pending            # generate embeddings
//! triage index build              # build the similarity index
//! triage label run                # classify unlabeled threads
//! triage query "vpn cert errors"  # ask the assistant
//! triage serve                    # start the review server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`connector_rooms`] | Messaging-API and archive-file connectors |
//! | [`ingest`] | Sync orchestration and message upserts |
//! | [`threads`] | Thread assembly |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`embed_cmd`] | Embedding backfill / rebuild / normalize |
//! | [`index`] | Persisted similarity index over thread roots |
//! | [`llm`] | LLM text-generation client |
//! | [`labeler`] | Thread labeling job |
//! | [`reconcile`] | Label reconciliation and solution selection |
//! | [`assistant`] | Query assistant |
//! | [`server`] | Review HTTP API + UI |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod assistant;
pub mod config;
pub mod connector_rooms;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod index;
pub mod ingest;
pub mod labeler;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod reconcile;
pub mod server;
pub mod stats;
pub mod threads;
