//! RAG prompt construction.
//!
//! The instruction block is a compile-time constant. Deployments may
//! replace it through `generation.instructions` in the config file, but it
//! is never mutated at runtime.

use crate::aggregate::SourceGroup;

/// Instructions prepended to every RAG prompt.
///
/// Changing this text changes model behaviour; the tests pin it verbatim.
pub const RAG_INSTRUCTIONS: &str = "
I will ask you a question and will provide some additional context information.
Assume this context information is factual and correct, as part of internal
documentation.
If the question relates to the context, answer it using the context.
If the question does not relate to the context, answer it as normal.

For example, let's say the context has nothing in it about tropical flowers;
then if I ask you about tropical flowers, just answer what you know about them
without referring to the context.

For example, if the context does mention minerology and I ask you about that,
provide information from the context along with general knowledge.
";

/// Build the prompt from the question and already-merged context blocks.
///
/// Blocks are joined with a single newline, in the order given.
pub fn build_prompt(question: &str, merged_contexts: &[String]) -> String {
    build_prompt_with(RAG_INSTRUCTIONS, question, merged_contexts)
}

/// Like [`build_prompt`] with a caller-supplied instruction block.
pub fn build_prompt_with(instructions: &str, question: &str, merged_contexts: &[String]) -> String {
    format!(
        "{}\nQuestion:\n{}\n\nContext:\n{}\n",
        instructions,
        question,
        merged_contexts.join("\n")
    )
}

/// Build the prompt directly from source groups.
pub fn prompt_for_groups(instructions: &str, question: &str, groups: &[SourceGroup]) -> String {
    let contexts: Vec<String> = groups.iter().map(SourceGroup::merged_text).collect();
    build_prompt_with(instructions, question, &contexts)
}
