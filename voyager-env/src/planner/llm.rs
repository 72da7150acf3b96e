//! Prompted skill generation on top of an [`LlmProvider`]

use super::{
    ChatMessage, CompletionRequest, ContextUpdate, FinishReason, LlmProvider, SkillPlanner, UsageTracker,
};
use crate::config::PlannerConfig;
use crate::error::{self, Result};
use crate::fetch::ExampleTransaction;
use crate::programs::ProgramRegistry;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = "\
You are an expert Solana developer helping an agent explore the Solana blockchain. \
The agent learns to interact with on-chain programs by writing TypeScript skills. \
Answer with a single TypeScript code block and nothing else.";

const SKILL_TEMPLATE: &str = r#"```typescript
import { Transaction, PublicKey, TransactionInstruction } from '@solana/web3.js';

export async function executeSkill(blockhash: string): Promise<string> {
    const tx = new Transaction();
    const PROGRAM_ID = new PublicKey("PASTE_PROGRAM_ID_HERE");

    // build one or more instructions here

    tx.recentBlockhash = blockhash;
    tx.feePayer = new PublicKey("AGENT_PUBKEY");
    return tx.serialize({ requireAllSignatures: false, verifySignatures: false }).toString('base64');
}
```"#;

/// Longest log excerpt per fetched example
const EXAMPLE_LOG_CHARS: usize = 2000;

/// Per-run context the prompt is built from
#[derive(Debug, Default)]
struct PlannerContext {
    discovered: BTreeSet<String>,
    skills: Vec<String>,
    examples: Option<(String, Vec<ExampleTransaction>)>,
}

/// Writes skills by prompting a chat model
pub struct LlmPlanner<P: LlmProvider> {
    provider: P,
    registry: Arc<ProgramRegistry>,
    model: Option<String>,
    temperature: f32,
    max_tokens: usize,
    context: RwLock<PlannerContext>,
    usage: RwLock<UsageTracker>,
}

impl<P: LlmProvider> LlmPlanner<P> {
    pub fn new(provider: P, registry: Arc<ProgramRegistry>, config: &PlannerConfig) -> Self {
        Self {
            provider,
            registry,
            model: Some(config.model.clone()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            context: RwLock::new(PlannerContext::default()),
            usage: RwLock::new(UsageTracker::new()),
        }
    }

    /// Protocols already found; they are left out of generated objectives
    pub fn update_discovered<I, S>(&self, protocols: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut ctx) = self.context.write() {
            ctx.discovered.extend(protocols.into_iter().map(Into::into));
        }
    }

    /// Names of the skills already in the library
    pub fn set_skills(&self, skills: Vec<String>) {
        if let Ok(mut ctx) = self.context.write() {
            ctx.skills = skills;
        }
    }

    /// Examples shown in the next prompts
    pub fn set_examples(&self, program_id: impl Into<String>, examples: Vec<ExampleTransaction>) {
        if let Ok(mut ctx) = self.context.write() {
            ctx.examples = Some((program_id.into(), examples));
        }
    }

    pub fn reset(&self) {
        if let Ok(mut ctx) = self.context.write() {
            *ctx = PlannerContext::default();
        }
    }

    pub fn usage(&self) -> UsageTracker {
        self.usage.read().map(|u| u.clone()).unwrap_or_default()
    }

    /// Objective naming the registry programs whose protocol is still undiscovered
    pub fn auto_objective(&self) -> String {
        let discovered = self
            .context
            .read()
            .map(|ctx| ctx.discovered.clone())
            .unwrap_or_default();
        let undiscovered: Vec<&str> = self
            .registry
            .iter()
            .filter(|(_, entry)| !discovered.contains(&entry.project_name))
            .map(|(address, _)| address)
            .collect();
        if undiscovered.is_empty() {
            "Create a skill that exercises a new instruction of an already discovered protocol".to_string()
        } else {
            format!(
                "Create a skill to interact with one of these undiscovered protocols: {}",
                undiscovered.join(", ")
            )
        }
    }

    /// Render the user prompt
    pub fn render_prompt(&self, observation: &Value, objective: &str, error: Option<&str>) -> String {
        let ctx = match self.context.read() {
            Ok(ctx) => ctx,
            Err(poisoned) => poisoned.into_inner(),
        };
        let agent = observation
            .get("agent_pubkey")
            .and_then(Value::as_str)
            .unwrap_or("AGENT_PUBKEY");
        let balance = observation.get("sol_balance").and_then(Value::as_f64).unwrap_or(0.0);
        let height = observation.get("block_height").and_then(Value::as_u64).unwrap_or(0);

        let mut prompt = String::new();
        let _ = writeln!(prompt, "=== CURRENT STATE ===");
        let _ = writeln!(prompt, "Wallet balance: {:.4} SOL", balance);
        let _ = writeln!(prompt, "Block height: {}", height);
        let _ = writeln!(prompt, "Skills created: {}", ctx.skills.len());
        let _ = writeln!(prompt, "Protocols discovered: {}", ctx.discovered.len());
        let _ = writeln!(prompt, "Your public key: {}", agent);
        let _ = writeln!(prompt, "Observation: {}", observation);

        let _ = writeln!(prompt, "\n=== YOUR MISSION ===\n{}", objective);

        let _ = writeln!(prompt, "\n=== KNOWN PROGRAMS ===");
        for (address, _) in self.registry.iter() {
            let label = self.registry.label(address).unwrap_or_default();
            let seen = self
                .registry
                .display_name(address)
                .map(|name| ctx.discovered.contains(name))
                .unwrap_or(false);
            let _ = writeln!(prompt, "- {} {} {}", address, label, if seen { "(discovered)" } else { "" });
        }

        let _ = writeln!(prompt, "\n=== HOW DISCOVERY WORKS ===");
        prompt.push_str(
            "A program counts as discovered when it is the programId of an instruction in your \
             transaction, or appears in its account keys. A SystemProgram transfer to a program \
             address only interacts with the System Program. New instruction variants \
             (first byte of instruction data) on a known program earn extra reward.\n",
        );

        let _ = writeln!(prompt, "\n=== SKILL TEMPLATE ===\n{}", SKILL_TEMPLATE.replace("AGENT_PUBKEY", agent));
        prompt.push_str(
            "\nRules:\n\
             1. Build exactly ONE unsigned transaction.\n\
             2. The agent is the only signer and the fee payer.\n\
             3. Use the blockhash passed to executeSkill; the environment supplies a fresh one.\n\
             4. Return the base64 serialized transaction.\n",
        );

        let _ = writeln!(prompt, "\n=== EXISTING SKILLS ===");
        if ctx.skills.is_empty() {
            let _ = writeln!(prompt, "None yet, you are writing the first one.");
        } else {
            for name in &ctx.skills {
                let _ = writeln!(prompt, "- {}", name);
            }
        }

        if let Some((program_id, examples)) = &ctx.examples {
            let _ = writeln!(prompt, "\n=== RECENT TRANSACTIONS FOR {} ===", program_id);
            for (i, ex) in examples.iter().enumerate() {
                let sig: String = ex.signature.chars().take(16).collect();
                let _ = writeln!(
                    prompt,
                    "\nExample {}: {}... {}",
                    i + 1,
                    sig,
                    if ex.success { "SUCCESS" } else { "FAILED" }
                );
                if let Some(err) = &ex.error {
                    let _ = writeln!(prompt, "Error: {}", err);
                }
                let _ = writeln!(prompt, "Instructions (execution order):");
                for ix in ex.instructions.iter().take(10) {
                    let _ = writeln!(prompt, "  {} depth={} program={}", ix.label, ix.depth, ix.program_id);
                }
                let logs = ex.logs.join("\n");
                let cut: String = logs.chars().take(EXAMPLE_LOG_CHARS).collect();
                let _ = writeln!(prompt, "Logs:\n{}", cut);
                if cut.len() < logs.len() {
                    let _ = writeln!(prompt, "... (truncated)");
                }
            }
            prompt.push_str(
                "\nInstruction \"0\" runs first, then \"0.0\", \"0.1\" (invoked by 0), then \"1\".\n",
            );
        }

        if let Some(error) = error {
            let _ = writeln!(prompt, "\n=== PREVIOUS ATTEMPT FAILED ===\n{}", error);
            prompt.push_str(
                "Fix the cause above. Anchor programs expect an 8-byte discriminator at the start \
                 of instruction data.\n",
            );
        }

        let _ = writeln!(prompt, "\n=== YOUR TASK ===");
        prompt.push_str("Write the complete TypeScript skill. Return ONLY the code.\n");
        prompt
    }
}

impl<P: LlmProvider> SkillPlanner for LlmPlanner<P> {
    async fn propose(&self, observation: &Value, objective: &str, error: Option<&str>) -> Result<String> {
        let objective = if objective.trim().is_empty() {
            let generated = self.auto_objective();
            info!(objective = %generated, "generated objective");
            generated
        } else {
            objective.to_string()
        };

        let prompt = self.render_prompt(observation, &objective, error);
        debug!(chars = prompt.len(), retry = error.is_some(), "planner prompt rendered");

        let mut request = CompletionRequest::new(vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)])
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens);
        if let Some(model) = &self.model {
            request = request.with_model(model.clone());
        }

        let response = self.provider.complete(request).await?;
        if let Ok(mut usage) = self.usage.write() {
            usage.track(&response.model, &response.usage);
        }
        debug!(id = %response.id, model = %response.model, finish = ?response.finish_reason, "planner reply");
        match response.finish_reason {
            FinishReason::Length => {
                warn!(max_tokens = self.max_tokens, "planner reply truncated");
                return Err(error::inference_failed(format!(
                    "reply cut off at max_tokens ({}); the skill would be incomplete",
                    self.max_tokens
                ))
                .with_operation("planner::propose"));
            }
            FinishReason::ContentFilter => {
                return Err(error::inference_failed("reply withheld by the provider's content filter")
                    .with_operation("planner::propose"));
            }
            FinishReason::Stop | FinishReason::Unknown => {}
        }

        let content = response
            .content
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| error::inference_failed("planner returned no content"))?;
        let code = extract_code(&content);
        if code.trim().is_empty() {
            return Err(error::inference_failed("planner returned an empty code block"));
        }
        Ok(code)
    }

    fn update_context(&self, update: ContextUpdate) {
        match update {
            ContextUpdate::Discovered(protocols) => self.update_discovered(protocols),
            ContextUpdate::Skills(skills) => self.set_skills(skills),
            ContextUpdate::Examples { program_id, examples } => self.set_examples(program_id, examples),
            ContextUpdate::Reset => self.reset(),
        }
    }
}

/// Body of the first ```typescript, ```ts or bare ``` block; the whole
/// reply when there is no closed fence.
pub fn extract_code(reply: &str) -> String {
    for fence in ["```typescript", "```ts", "```"] {
        if let Some(start) = reply.find(fence) {
            let body = &reply[start + fence.len()..];
            if let Some(end) = body.find("```") {
                return body[..end].trim().to_string();
            }
        }
    }
    reply.trim().to_string()
}
