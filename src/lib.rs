// src/lib.rs

// 1. Data Structures (The "Nouns")
// explicit 'pub' makes them available to main.rs
pub mod models;

// 2. Interfaces (The "Contract")
pub mod traits;

// 3. Exchange Calendar (The "Clock")
pub mod clock;

// 4. Cancellable Requests (The "Plumbing")
pub mod fetch;

// 5. Refresh Versions, Debounce & Polling (The "Triggers")
pub mod trigger;

// 6. Snapshot Slot (The "Memory")
pub mod cache;

// 7. Backend Endpoints (The "Client")
pub mod api;

// 8. Synchronization Controller (The "Orchestrator")
pub mod sync;

// 9. Offline Response Cache (The "Edge")
pub mod offline;

// 10. Configuration
pub mod config;

// 11. Web Dashboard & Edge Proxy
pub mod dashboard;
