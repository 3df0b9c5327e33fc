//! Single-owner task driving one [`Conversation`].

use proto::{ApprovalSignal, Checkpoint, ConversationError, LoopState, TurnInput};
use tokio::sync::{mpsc, oneshot};
use tools::RepoScope;
use tracing::{debug, info, warn};

use crate::conversation::{Conversation, TurnOutcome};
use crate::publisher::{EventSubscription, StreamPublisher};

const COMMAND_QUEUE: usize = 64;

/// Result of one command, as returned by the conversation.
pub type CommandResult = Result<TurnOutcome, ConversationError>;

/// Work queued for a conversation actor.
#[derive(Debug)]
pub enum ConversationCommand {
    Input {
        input: TurnInput,
        reply: oneshot::Sender<CommandResult>,
    },
    Decision {
        signal: ApprovalSignal,
        reply: oneshot::Sender<CommandResult>,
    },
}

/// Outcome of a queued command, available once the actor has run it.
///
/// Dropping the receipt is fine; events still reach subscribers.
pub struct CommandReceipt {
    rx: oneshot::Receiver<CommandResult>,
}

impl CommandReceipt {
    /// Waits for the command to finish (the whole turn segment for an input).
    pub async fn outcome(self) -> CommandResult {
        self.rx.await.unwrap_or(Err(ConversationError::Closed))
    }
}

/// Cloneable handle to a running conversation.
#[derive(Clone)]
pub struct ConversationHandle {
    commands: mpsc::Sender<ConversationCommand>,
    publisher: StreamPublisher,
    scope: RepoScope,
}

impl ConversationHandle {
    /// Queues a user message or `clear`. Output arrives on the event stream.
    pub async fn submit(&self, input: TurnInput) -> Result<CommandReceipt, ConversationError> {
        let (reply, rx) = oneshot::channel();
        self.send(ConversationCommand::Input { input, reply }).await?;
        Ok(CommandReceipt { rx })
    }

    /// Queues an approval decision.
    pub async fn decide(&self, signal: ApprovalSignal) -> Result<CommandReceipt, ConversationError> {
        let (reply, rx) = oneshot::channel();
        self.send(ConversationCommand::Decision { signal, reply })
            .await?;
        Ok(CommandReceipt { rx })
    }

    async fn send(&self, command: ConversationCommand) -> Result<(), ConversationError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ConversationError::Closed)
    }

    /// Latest checkpoint plus every event after it.
    pub fn attach(&self) -> (Checkpoint, EventSubscription) {
        self.publisher.attach()
    }

    pub fn scope(&self) -> &RepoScope {
        &self.scope
    }

    /// Loop state as of the latest checkpoint.
    pub fn state(&self) -> LoopState {
        self.publisher.current_checkpoint().state
    }

    /// True once the actor task has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Moves `conversation` into its own task and returns a handle to it.
///
/// Commands run strictly one after another; a decision sent mid-generation
/// is applied once the current call returns.
pub fn spawn_conversation(conversation: Conversation) -> ConversationHandle {
    let (tx, mut rx) = mpsc::channel::<ConversationCommand>(COMMAND_QUEUE);
    let publisher = conversation.publisher().clone();
    let scope = conversation.scope().clone();

    tokio::spawn(async move {
        let mut conversation = conversation;
        info!(scope = %conversation.scope(), "Conversation actor started");
        while let Some(command) = rx.recv().await {
            let (result, reply) = match command {
                ConversationCommand::Input { input, reply } => {
                    (conversation.handle_input(input).await, reply)
                }
                ConversationCommand::Decision { signal, reply } => {
                    (conversation.handle_decision(signal).await, reply)
                }
            };
            match &result {
                Ok(TurnOutcome::Unchanged) => {}
                Ok(outcome) => debug!(scope = %conversation.scope(), ?outcome, "Command done"),
                Err(e) => warn!(scope = %conversation.scope(), error = %e, "Command failed"),
            }
            // The submitter may have stopped waiting.
            let _ = reply.send(result);
        }
        info!(scope = %conversation.scope(), "Conversation actor stopped");
    });

    ConversationHandle {
        commands: tx,
        publisher,
        scope,
    }
}
