// ===================================================================================================
// Billmesh - Usage-Based Subscription Billing Engine
// ===================================================================================================
//
// This library implements the subscription lifecycle engine behind a usage-based billing
// product: the state machine that carries a subscription through trial, active, past-due and
// terminal states; the periodic schedulers that advance subscriptions through billing cycles;
// the materialization of billing periods into invoices with proration and credits; and the
// entitlement evaluator that decides, per feature usage event, whether to allow, throttle or
// deny, and at what cost.
//
// ## KEY DESIGN PRINCIPLES
//
// ### 1. Per-Subscription Serialization
// Workers are horizontally scaled, so mutual exclusion lives in the database: a persisted
// lease (owner token + expiry) serializes every writer for one (project, subscription) pair
// while different subscriptions proceed in parallel.
//
// ### 2. Idempotence Everywhere
// Every externally observable side effect is keyed: billing periods by their cycle window,
// invoices by their statement key, invoice items by their billing period, usage reports by
// an idempotence key. Concurrent schedulers race freely; exactly one insert wins and the
// loser re-reads.
//
// ### 3. Money and Time Discipline
// Monetary amounts are integer minor units end to end; proration uses a floating factor but
// each line amount is rounded exactly once at persistence. Cycle windows are half-open and
// computed on an anchored calendar grid that rolls short months forward rather than clamping.
//
// ### 4. Actor-Style Lifecycle Machine
// Subscription transitions are a pure function over (state, event, context) with async
// invokes; events queue FIFO per instance so overlapping invokes cannot interleave, and the
// terminal error state carries the externally reported failure.
//
// ===================================================================================================

// ===== FOUNDATIONS =====
pub mod error;                    // Billing error types, denied reasons, caller error codes
pub mod types;                    // Core data model: entities, enums, money and time helpers
pub mod config;                   // TOML configuration with sectioned defaults
pub mod logging;                  // Structured logging setup with env-filter support

// ===== PURE BILLING LOGIC =====
pub mod calendar_cycle;           // Anchored cycle windows, proration factors, calendar stepping
pub mod grant_snapshot;           // Priority merge of active grants with version hashing
pub mod pricing;                  // Waterfall pricing across grants with graduated tiers

// ===== PERSISTENCE AND EXTERNAL INTERFACES =====
pub mod database;                 // SQLite persistence for every billing entity
pub mod subscription_lock;        // Persisted lease serializing writers per subscription
pub mod analytics;                // Usage analytics interface with in-memory implementation
pub mod payment_provider;         // Payment provider interface with deterministic mock

// ===== ENTITLEMENTS AND METERING =====
pub mod usage_meter;              // Meter reconciliation, cycle resets, aggregation folding
pub mod entitlement;              // Entitlement evaluator: verify and report with caching

// ===== INVOICE PIPELINE =====
pub mod period_materializer;      // Idempotent billing period generation and phase changes
pub mod invoice_assembler;        // Statement grouping of periods into draft invoices
pub mod invoice_finalizer;        // Quantity recompute, waterfall pricing, credits, provider upsert
pub mod payment_collector;        // Collection driving invoices to terminal states

// ===== ORCHESTRATION =====
pub mod subscription_machine;     // Actor-style lifecycle state machine with guards and invokes
pub mod schedulers;               // Five periodic loops with lock-guarded fan-out
pub mod engine;                   // Public facade wiring the layers together

// ===== BINARY SUPPORT =====
pub mod cli;                      // Command line argument parsing
