use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::queue::Ticket;
use super::single_threaded::{SingleThreadedRuntime, WeakRuntime};
use super::MessageContext;
use crate::agent::AgentRef;
use crate::envelope::ReplySlot;
use crate::{AnyMessage, Result, RuntimeError};

pub(crate) enum Outcome {
    Reply(ReplySlot),
    Publish,
}

/// One message for one agent.
pub(crate) struct Delivery {
    pub message: AnyMessage,
    pub ctx: MessageContext,
    pub outcome: Outcome,
    pub ticket: Arc<Ticket>,
}

/// Mailbox of one live agent. Deliveries run strictly one at a time in
/// arrival order.
pub(crate) struct Mailbox {
    tx: mpsc::UnboundedSender<Delivery>,
    task: JoinHandle<()>,
}

impl Mailbox {
    /// The worker holds the runtime weakly and stops once it is dropped.
    pub fn spawn(agent: AgentRef, runtime: WeakRuntime) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let task = tokio::spawn(async move {
            debug!(target: "runtime", agent_id = %agent.id(), "Mailbox worker started");
            while let Some(delivery) = rx.recv().await {
                let Some(runtime) = runtime.upgrade() else {
                    break;
                };
                process(&agent, delivery, &runtime).await;
            }
            debug!(target: "runtime", agent_id = %agent.id(), "Mailbox worker stopped");
        });
        Self { tx, task }
    }

    /// Queue a delivery. A worker that is gone drops it, which fails a
    /// waiting sender with `RuntimeStopped`.
    pub fn deliver(&self, delivery: Delivery) {
        if let Err(mpsc::error::SendError(delivery)) = self.tx.send(delivery) {
            warn!(
                target: "runtime",
                agent_id = %delivery.ctx.recipient(),
                "Mailbox closed; dropping delivery"
            );
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

async fn handle(agent: &AgentRef, message: AnyMessage, ctx: MessageContext) -> Result<Option<AnyMessage>> {
    let token = ctx.cancellation_token().clone();
    let mut guard = token.run_until_cancelled(agent.lock()).await?;
    let handled = AssertUnwindSafe(guard.on_message(message, ctx)).catch_unwind();
    match token.run_until_cancelled(handled).await? {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::handler("handler panicked")),
    }
}

async fn process(agent: &AgentRef, delivery: Delivery, runtime: &SingleThreadedRuntime) {
    let Delivery {
        message,
        ctx,
        outcome,
        ticket,
    } = delivery;
    let recipient = ctx.recipient().clone();
    let sender = ctx.sender().cloned();
    let message_type = message.type_name();

    let result = handle(agent, message, ctx).await;
    runtime.record_outcome(&result);

    match outcome {
        Outcome::Reply(slot) => {
            let result = match result {
                Ok(Some(reply)) => runtime
                    .intervene_response(reply, &recipient, sender.as_ref())
                    .await
                    .map(Some),
                other => other,
            };
            if slot.send(result).is_err() {
                debug!(target: "runtime", agent_id = %recipient, message_type, "Sender went away before reply");
            }
        }
        Outcome::Publish => {
            let failure = match result {
                Ok(None) => None,
                Ok(Some(_)) => Some(RuntimeError::ReplyOnPublish {
                    agent: recipient.clone(),
                    message_type: message_type.to_string(),
                }),
                Err(e) => Some(e),
            };
            if let Some(err) = failure {
                warn!(target: "runtime", agent_id = %recipient, message_type, error = %err, "Published delivery failed");
                runtime.record_unhandled(err);
            }
        }
    }
    drop(ticket);
}
