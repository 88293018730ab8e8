use std::io;

use dialoguer::{Input, Password, theme::ColorfulTheme};

use crate::error::{Error, Result};

/// Interactive questions asked while gathering login factors
pub trait Prompter {
    fn input(&self, prompt: &str) -> Result<String>;

    /// Like `input`, without echoing the answer.
    fn password(&self, prompt: &str) -> Result<String>;
}

pub struct TerminalPrompter {
    theme: ColorfulTheme,
}

impl Default for TerminalPrompter {
    fn default() -> Self {
        Self {
            theme: ColorfulTheme::default(),
        }
    }
}

impl Prompter for TerminalPrompter {
    fn input(&self, prompt: &str) -> Result<String> {
        Input::<String>::with_theme(&self.theme)
            .with_prompt(prompt)
            .allow_empty(true)
            .interact_text()
            .map_err(|e| Error::Io(io::Error::other(e)))
    }

    fn password(&self, prompt: &str) -> Result<String> {
        Password::with_theme(&self.theme)
            .with_prompt(prompt)
            .allow_empty_password(true)
            .interact()
            .map_err(|e| Error::Io(io::Error::other(e)))
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::{cell::RefCell, collections::VecDeque};

    /// Answers prompts from a script and records what was asked.
    #[derive(Default)]
    pub struct ScriptedPrompter {
        answers: RefCell<VecDeque<String>>,
        asked: RefCell<Vec<String>>,
    }

    impl ScriptedPrompter {
        pub fn new(answers: &[&str]) -> Self {
            Self {
                answers: RefCell::new(answers.iter().map(|a| a.to_string()).collect()),
                asked: RefCell::default(),
            }
        }

        pub fn asked(&self) -> Vec<String> {
            self.asked.borrow().clone()
        }

        fn next(&self, prompt: &str) -> Result<String> {
            self.asked.borrow_mut().push(prompt.to_string());
            self.answers.borrow_mut().pop_front().ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("unexpected prompt: {prompt}"),
                ))
            })
        }
    }

    impl Prompter for ScriptedPrompter {
        fn input(&self, prompt: &str) -> Result<String> {
            self.next(prompt)
        }

        fn password(&self, prompt: &str) -> Result<String> {
            self.next(prompt)
        }
    }
}
