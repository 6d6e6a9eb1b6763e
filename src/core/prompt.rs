/// Interactive input/output used by the restore flow

use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

pub trait Prompt {
    /// Show a line of output
    fn say(&mut self, line: &str);

    /// Show `question` and read one trimmed line of input
    fn ask(&mut self, question: &str) -> Result<String>;

    /// Ask a yes/no question. Only `y` (any case) counts as yes.
    fn confirm(&mut self, question: &str) -> Result<bool> {
        let answer = self.ask(&format!("{} (y/n): ", question))?;
        Ok(answer.eq_ignore_ascii_case("y"))
    }
}

/// Prompt bound to the process stdin/stdout
pub struct TerminalPrompt<R = io::StdinLock<'static>> {
    input: R,
}

impl TerminalPrompt {
    pub fn stdin() -> Self {
        Self {
            input: io::stdin().lock(),
        }
    }
}

impl<R: BufRead> TerminalPrompt<R> {
    pub fn from_reader(input: R) -> Self {
        Self { input }
    }
}

impl<R: BufRead> Prompt for TerminalPrompt<R> {
    fn say(&mut self, line: &str) {
        println!("{}", line);
    }

    fn ask(&mut self, question: &str) -> Result<String> {
        print!("{}", question);
        io::stdout().flush().context("Failed to flush stdout")?;

        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .context("Failed to read user input")?;
        if read == 0 {
            // EOF would otherwise spin the retry loops forever
            return Err(anyhow!("input closed while waiting for an answer"));
        }
        Ok(line.trim().to_string())
    }
}

/// Replays canned answers and records everything shown
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    answers: VecDeque<String>,
    pub transcript: Vec<String>,
}

impl ScriptedPrompt {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            transcript: Vec::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.answers.len()
    }

    pub fn saw(&self, needle: &str) -> bool {
        self.transcript.iter().any(|line| line.contains(needle))
    }
}

impl Prompt for ScriptedPrompt {
    fn say(&mut self, line: &str) {
        self.transcript.push(line.to_string());
    }

    fn ask(&mut self, question: &str) -> Result<String> {
        self.transcript.push(question.to_string());
        self.answers
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted answer for: {}", question))
    }
}
