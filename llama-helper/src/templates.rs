// ============================================================================
// Prompt Templates (Model-Specific Formatting)
// ============================================================================

use anyhow::{anyhow, Result};

/// ChatML, used by Qwen and many fine-tunes
pub const CHATML_TEMPLATE: &str = "\
<|im_start|>user
{user_prompt}<|im_end|>
<|im_start|>assistant
";

/// Gemma 3 chat template format
pub const GEMMA3_TEMPLATE: &str = "\
<start_of_turn>user
{user_prompt}<end_of_turn>
<start_of_turn>model
";

/// Llama 3 instruct format. The BOS token is added by the tokenizer.
pub const LLAMA3_TEMPLATE: &str = "\
<|start_header_id|>user<|end_header_id|>

{user_prompt}<|eot_id|><|start_header_id|>assistant<|end_header_id|>

";

/// Format a single user turn using the specified template
///
/// # Arguments
/// * `template_name` - Template identifier ("chatml", "gemma3" or "llama3")
/// * `user_prompt` - User message
pub fn format_prompt(template_name: &str, user_prompt: &str) -> Result<String> {
    let template = match template_name {
        "chatml" => CHATML_TEMPLATE,
        "gemma3" => GEMMA3_TEMPLATE,
        "llama3" => LLAMA3_TEMPLATE,
        _ => return Err(anyhow!("Unknown template: {}", template_name)),
    };

    Ok(template.replace("{user_prompt}", user_prompt))
}
