pub mod types;
pub mod input;
pub mod document;
pub mod detection; // Candidate generation, validation, assembly, consensus
pub mod completion; // Ollama text client + prompts
pub mod extraction; // Page images + vision OCR
pub mod escalation; // Tiered repair loop + ledger
pub mod coverage;
pub mod report;
pub mod diagnostic; // Spans JSONL + report directory
pub mod processor;
