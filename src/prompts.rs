use crate::providers::RetrievedDocument;

/// Build the retrieval-grounded prompt for a user question.
///
/// Retrieved chunk texts are joined with a single space, in search order.
pub fn context_prompt(documents: &[RetrievedDocument], question: &str) -> String {
    let context = documents
        .iter()
        .map(|doc| doc.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        "Context: {}\n\nQuestion: {}\n\nPlease provide a relevant answer based on the context provided.",
        context, question
    )
}

/// Prompt asking for a plain-language summary of a contract
pub fn summary_prompt(contract_text: &str) -> String {
    format!("{}{}", SUMMARY_PROMPT, contract_text)
}

/// Prompt asking for every obligation in a contract as a fenced JSON array
pub fn obligations_prompt(contract_text: &str) -> String {
    format!("{}{}", OBLIGATIONS_PROMPT, contract_text)
}

/// System instruction used when summarizing contracts
pub fn summary_instruction() -> &'static str {
    SUMMARY_INSTRUCTION
}

const SUMMARY_INSTRUCTION: &str = r#"You are a helpful assistant that makes contracts easy to understand.
Your summaries should:
- Use simple, clear language
- Avoid legal jargon
- Be organized and easy to read
- Only include information that's actually in the contract
- Be accurate and complete
"#;

const SUMMARY_PROMPT: &str = r#"Please summarize this contract in plain language, covering:

1. Who is involved?
2. What is the main purpose?
3. What are the main responsibilities?
4. Important dates and deadlines
5. Money-related terms
6. How to end the contract
7. Other important points

Contract text: "#;

const OBLIGATIONS_PROMPT: &str = r#"Extract structured data from the following contract.
Answer with a single ```json fenced block holding a JSON array and no other text.
Each element describes one obligation of one party:
{
  "entityName": string,
  "obligationType": string,
  "description": string,
  "penalties": string,
  "keyDates": string,
  "risk": string
}

Contract: "#;
