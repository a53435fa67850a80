use tokenflow_common::ConversationMessage;

/// Role markers used to flatten a conversation into a single prompt for
/// the completion backend. Defaults follow the ChatML convention.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub system_prefix: String,
    pub system_suffix: String,
    pub user_prefix: String,
    pub user_suffix: String,
    pub assistant_prefix: String,
    pub assistant_suffix: String,
    pub tool_prefix: String,
    pub tool_suffix: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            system_prefix: "<|im_start|>system\n".to_string(),
            system_suffix: "<|im_end|>\n".to_string(),
            user_prefix: "<|im_start|>user\n".to_string(),
            user_suffix: "<|im_end|>\n".to_string(),
            assistant_prefix: "<|im_start|>assistant\n".to_string(),
            assistant_suffix: "<|im_end|>\n".to_string(),
            tool_prefix: "<|im_start|>tool\n".to_string(),
            tool_suffix: "<|im_end|>\n".to_string(),
        }
    }
}

impl PromptTemplate {
    /// Format a normalized conversation into a prompt, ending with the
    /// assistant prefix so the model continues as the assistant.
    pub fn format_prompt(&self, messages: &[ConversationMessage]) -> String {
        let mut prompt = String::with_capacity(1024);

        for message in messages {
            let (prefix, suffix) = match message.role.as_str() {
                "system" => (&self.system_prefix, &self.system_suffix),
                "assistant" => (&self.assistant_prefix, &self.assistant_suffix),
                "tool" => (&self.tool_prefix, &self.tool_suffix),
                _ => (&self.user_prefix, &self.user_suffix),
            };

            prompt.push_str(prefix);
            if let Some(content) = &message.content {
                prompt.push_str(content);
            }
            // Prior tool invocations are replayed inline so the model sees
            // its own call history.
            if let Some(tool_calls) = &message.tool_calls {
                for call in tool_calls {
                    if let Ok(rendered) = serde_json::to_string(&call) {
                        if !prompt.ends_with('\n') {
                            prompt.push('\n');
                        }
                        prompt.push_str(&rendered);
                    }
                }
            }
            prompt.push_str(suffix);
        }

        prompt.push_str(&self.assistant_prefix);
        prompt
    }
}
