//! # autospan - eBPF Auto-Instrumentation for Network Services
//!
//! autospan attaches eBPF programs to running processes, reassembles the
//! HTTP, HTTP/2, gRPC and TCP traffic they see into request spans, and
//! exports those spans together with per-service request counters. The
//! traced programs need no code changes.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Traced Processes                             │
//! │           (HTTP / gRPC / TLS / raw TCP servers)                 │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ syscalls, tcp_*, SSL_* calls
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     eBPF Programs (Kernel)                      │
//! │  • Kernel: tcp_sendmsg/recvmsg, accept4/connect, clone/exit     │
//! │  • libssl: SSL_read/SSL_write/SSL_do_handshake                  │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ ring buffer records (tag byte + payload)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    autospan (This Crate)                        │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐        │
//! │  │  Discovery   │──▶│   Tracers    │──▶│  Span Queue  │        │
//! │  │  (/proc)     │   │ decode+corr. │   │  (bounded)   │        │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘        │
//! │                                               ▼                 │
//! │                     ┌──────────────┐   ┌──────────────┐        │
//! │                     │ Label Cache  │◀──│ Export Stage │        │
//! │                     │ (TTL sweep)  │   │ reporter LRU │        │
//! │                     └──────────────┘   └──────────────┘        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`decode`]: Tagged ring buffer records to typed fragments
//! - [`correlate`]: Pairs requests with responses per connection, tracks TLS
//!   plaintext and trace context propagation
//! - [`tracer`]: Per-process tracer lifecycle over an [`tracer::EventSource`]
//! - [`discovery`]: Process selection and the lifecycle manager that runs
//!   one tracer per matched process
//! - [`queue`]: The bounded span queue shared by every tracer
//! - [`export`]: Reporter pool, span writers and TTL-expired counters
//! - [`clock`]: Injectable time source
//! - [`domain`]: Core domain types and errors
//! - [`cli`], [`preflight`]: Command line and system checks
//!
//! ## Typical Usage
//!
//! ```bash
//! # Trace every nginx process
//! sudo ./autospan --exec nginx
//!
//! # Trace whatever listens on 8080-8089, spans to a file
//! sudo ./autospan --open-ports 8080-8089 --spans-out spans.jsonl
//! ```

pub mod cli;
pub mod clock;
pub mod correlate;
pub mod decode;
pub mod discovery;
pub mod domain;
pub mod export;
pub mod preflight;
pub mod queue;
pub mod tracer;
