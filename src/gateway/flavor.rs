//! Synthetic flavor events derived from recognized log lines.
//!
//! A pure function of the message text: whether an event fires is fully
//! deterministic, only the template wording is randomized. Derived events
//! are interleaved immediately after the log frame that triggered them.

use rand::Rng;
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlavorCategory {
    Generation,
    Compilation,
    Errors,
    Deployment,
    Celebration,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlavorEvent {
    pub category: FlavorCategory,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl FlavorEvent {
    fn new(category: FlavorCategory, msg: impl Into<String>) -> Self {
        Self {
            category,
            msg: msg.into(),
            contract_name: None,
            address: None,
        }
    }
}

/// Context carried across a stream so deploy events can name the contract.
#[derive(Debug, Clone, Default)]
pub struct FlavorContext {
    pub network: Option<String>,
    pub contract_name: Option<String>,
}

const GENERATION_TEMPLATES: &[&str] = &[
    "Drafting the contract from your prompt…",
    "The generator sharpens its quill…",
    "Turning intent into Solidity, line by line…",
    "Sketching storage layouts and guard rails…",
];

const COMPILATION_TEMPLATES: &[&str] = &[
    "Resolving imports and pragma ranges…",
    "The compiler weighs every opcode…",
    "Collecting dependencies from the OpenZeppelin shelf…",
    "Bytecode taking shape…",
];

const ERROR_TEMPLATES: &[&str] = &[
    "A compiler riddle appears; adjusting the draft…",
    "Constructor arguments need another look…",
    "Retrying with what the last attempt taught us…",
];

const DEPLOYMENT_TEMPLATES: &[&str] = &[
    "Broadcasting the deployment transaction…",
    "Waiting for the network to seal the block…",
    "Anchoring your contract on-chain…",
];

fn pick(templates: &[&str]) -> String {
    let index = rand::thread_rng().gen_range(0..templates.len());
    templates[index].to_string()
}

struct Patterns {
    stage_generate: Regex,
    generation_done: Regex,
    stage_compile: Regex,
    compile_iter: Regex,
    compiled_count: Regex,
    error_line: Regex,
    contract_chosen: Regex,
    stage_deploy: Regex,
    deploy_address: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        stage_generate: Regex::new(r"(?i)Stage:\s*generate").unwrap(),
        generation_done: Regex::new(r"(?i)Generation done in\s*(\d+)ms\.\s*Code size=(\d+)")
            .unwrap(),
        stage_compile: Regex::new(r"(?i)Stage:\s*compile").unwrap(),
        compile_iter: Regex::new(r"(?i)iter\s*(\d+)/(\d+):\s*compile\s*(ok|failed)").unwrap(),
        compiled_count: Regex::new(r"(?i)Compiled\s+(\d+)\s+Solidity files successfully").unwrap(),
        error_line: Regex::new(r"(?i)(?:\bERROR\b|TypeError:|SyntaxError:|Warning:)").unwrap(),
        contract_chosen: Regex::new(r"(?i)Contract chosen for deploy:\s*([A-Za-z0-9_]+)").unwrap(),
        stage_deploy: Regex::new(r"(?i)Stage:\s*deploy\s*->\s*network\s*([A-Za-z0-9_\-]+)")
            .unwrap(),
        deploy_address: Regex::new(r"Deploy success\. Address=(0x[a-fA-F0-9]{40})").unwrap(),
    })
}

/// Derive zero or more flavor events from one log line.
#[must_use]
pub fn flavor_from_log(message: &str, ctx: &FlavorContext) -> Vec<FlavorEvent> {
    let patterns = patterns();
    let mut out = Vec::new();

    if patterns.stage_generate.is_match(message) {
        out.push(FlavorEvent::new(
            FlavorCategory::Generation,
            pick(GENERATION_TEMPLATES),
        ));
    }
    if let Some(captures) = patterns.generation_done.captures(message) {
        let ms: u64 = captures[1].parse().unwrap_or(0);
        let secs = (ms / 1000).max(1);
        let size = &captures[2];
        out.push(FlavorEvent::new(
            FlavorCategory::Generation,
            format!("Generation complete in {secs}s: {size} characters drafted."),
        ));
    }

    if patterns.stage_compile.is_match(message) {
        out.push(FlavorEvent::new(
            FlavorCategory::Compilation,
            pick(COMPILATION_TEMPLATES),
        ));
    }
    if let Some(captures) = patterns.compile_iter.captures(message) {
        if captures[3].eq_ignore_ascii_case("failed") {
            let iteration = &captures[1];
            let max = &captures[2];
            out.push(FlavorEvent::new(
                FlavorCategory::Compilation,
                format!("Compiler pushed back; attempt {iteration}/{max} heads back in."),
            ));
        }
    }
    if let Some(captures) = patterns.compiled_count.captures(message) {
        let count = &captures[1];
        out.push(FlavorEvent::new(
            FlavorCategory::Compilation,
            format!("{count} Solidity files compiled clean."),
        ));
    }

    if patterns.error_line.is_match(message) {
        out.push(FlavorEvent::new(
            FlavorCategory::Errors,
            pick(ERROR_TEMPLATES),
        ));
    }

    if let Some(captures) = patterns.contract_chosen.captures(message) {
        let name = captures[1].to_string();
        let network = ctx.network.as_deref().unwrap_or("the network");
        let mut event = FlavorEvent::new(
            FlavorCategory::Deployment,
            format!("{name} selected for deployment to {network}."),
        );
        event.contract_name = Some(name);
        out.push(event);
    }
    if let Some(captures) = patterns.stage_deploy.captures(message) {
        let network = &captures[1];
        out.push(FlavorEvent::new(
            FlavorCategory::Deployment,
            format!("Deployment to {network} under way. {}", pick(DEPLOYMENT_TEMPLATES)),
        ));
    }
    if let Some(captures) = patterns.deploy_address.captures(message) {
        let address = captures[1].to_string();
        let mut event = FlavorEvent::new(
            FlavorCategory::Deployment,
            format!("Deployed at {address}."),
        );
        event.address = Some(address);
        out.push(event);

        let name = ctx.contract_name.as_deref().unwrap_or("Your contract");
        out.push(FlavorEvent::new(
            FlavorCategory::Celebration,
            format!("{name} is live on-chain."),
        ));
    }

    out
}
