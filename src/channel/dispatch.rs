//! Exchange, queue and basic class methods.

use tracing::{debug, trace};

use super::{Channel, Published};
use crate::{
    broker::Message,
    error::AmqpError,
    metrics,
    protocol::{
        ExchangeDeclare,
        ExchangeDelete,
        Method,
        QueueDeclare,
        QueueDeclareOk,
        QueueDelete,
        ReplyCode,
    },
    routing::{ExchangeDeclaration, ExchangeType},
};

impl Channel {
    /// Handle a method on an open channel. Errors are attributed to `method`
    /// by the caller.
    pub(super) async fn dispatch(&mut self, method: &Method) -> Result<(), AmqpError> {
        let broker = self.conn.broker();
        let connection = self.conn.id();
        match method {
            Method::ExchangeDeclare(declare) => self.exchange_declare(declare).await,
            Method::ExchangeDelete(delete) => self.exchange_delete(delete).await,
            Method::QueueDeclare(declare) => self.queue_declare(declare).await,
            Method::QueueBind(bind) => {
                broker.bind_queue(bind, connection)?;
                if !bind.no_wait {
                    self.reply(Method::QueueBindOk).await;
                }
                Ok(())
            }
            Method::QueueUnbind(unbind) => {
                broker.unbind_queue(unbind, connection)?;
                self.reply(Method::QueueUnbindOk).await;
                Ok(())
            }
            Method::QueueDelete(delete) => self.queue_delete(delete).await,
            other => {
                let (class_id, method_id) = other.ids();
                Err(AmqpError::command_invalid(format!(
                    "method {class_id}.{method_id} is not valid from a client on channel {}",
                    self.id
                )))
            }
        }
    }

    async fn exchange_declare(&self, declare: &ExchangeDeclare) -> Result<(), AmqpError> {
        // A passive declare only checks existence; the type is not inspected.
        let declaration = if declare.passive {
            ExchangeDeclaration::new(declare.exchange.as_str(), ExchangeType::Direct)
        } else {
            ExchangeDeclaration::from_method(declare)?
        };
        self.conn
            .broker()
            .declare_exchange(declaration, declare.passive)?;
        if !declare.no_wait {
            self.reply(Method::ExchangeDeclareOk).await;
        }
        Ok(())
    }

    async fn exchange_delete(&self, delete: &ExchangeDelete) -> Result<(), AmqpError> {
        self.conn
            .broker()
            .delete_exchange(&delete.exchange, delete.if_unused)?;
        if !delete.no_wait {
            self.reply(Method::ExchangeDeleteOk).await;
        }
        Ok(())
    }

    async fn queue_declare(&self, declare: &QueueDeclare) -> Result<(), AmqpError> {
        let queue = self
            .conn
            .broker()
            .declare_queue(declare, self.conn.id())?;
        if !declare.no_wait {
            self.reply(Method::QueueDeclareOk(QueueDeclareOk {
                queue: queue.name().to_owned(),
                message_count: queue.message_count(),
                consumer_count: 0,
            }))
            .await;
        }
        Ok(())
    }

    async fn queue_delete(&self, delete: &QueueDelete) -> Result<(), AmqpError> {
        let message_count = self
            .conn
            .broker()
            .delete_queue(delete, self.conn.id())?;
        if !delete.no_wait {
            self.reply(Method::QueueDeleteOk { message_count }).await;
        }
        Ok(())
    }

    /// Route a completed publish, returning it to the sender when it is
    /// mandatory and reached no queue.
    pub(super) async fn route(&self, published: &Published) -> Result<(), AmqpError> {
        let Published {
            publish,
            header,
            body,
        } = published;
        let broker = self.conn.broker();
        let exchange = broker
            .exchange(&publish.exchange)
            .ok_or_else(|| AmqpError::not_found(format!("no exchange '{}'", publish.exchange)))?;
        if exchange.is_internal() {
            return Err(AmqpError::access_refused(format!(
                "cannot publish to internal exchange '{}'",
                publish.exchange
            )));
        }
        let message = Message {
            id: broker.next_message_id(),
            publish: publish.clone(),
            header: header.clone(),
            body: body.clone(),
        };
        let id = message.id;
        let delivered = broker.publish(&exchange, message)?;
        if delivered > 0 {
            metrics::inc_routed();
            trace!(
                "message routed: connection_id={}, message_id={id}, exchange={}, \
                 routing_key={}, queues={delivered}",
                self.conn.id(),
                publish.exchange,
                publish.routing_key
            );
            return Ok(());
        }

        metrics::inc_unroutable();
        debug!(
            "message unroutable: connection_id={}, message_id={id}, exchange={}, \
             routing_key={}, mandatory={}",
            self.conn.id(),
            publish.exchange,
            publish.routing_key,
            publish.mandatory
        );
        if publish.mandatory {
            if !self.active {
                debug!(
                    "return suppressed by flow control: connection_id={}, channel={}",
                    self.conn.id(),
                    self.id
                );
                return Ok(());
            }
            let returned = exchange.return_message(publish, ReplyCode::NoRoute, "NO_ROUTE");
            self.conn
                .send_content(self.id, Method::BasicReturn(returned), header, body)
                .await;
        }
        Ok(())
    }
}
