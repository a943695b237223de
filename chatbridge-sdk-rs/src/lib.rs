pub mod agent;
pub mod backend;
pub mod delivery;
pub mod echo;
pub mod events;
pub mod llm;
pub mod logger;
pub mod prompts;
pub mod router;
pub mod runtime;
pub mod session;
pub mod timeline;
pub mod tools;
pub mod translator;
pub mod tui;
pub mod turn;
