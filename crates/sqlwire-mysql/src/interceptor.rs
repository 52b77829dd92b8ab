//! Hooks around query execution.

use sqlwire_core::Result;

use crate::session::QueryResult;

/// Observes or short-circuits queries run through [`MySqlSession::execute`].
///
/// [`MySqlSession::execute`]: crate::session::MySqlSession::execute
pub trait QueryInterceptor: Send {
    /// Called before the query is sent. Returning a result skips the round trip.
    fn pre_process(&mut self, sql: &str) -> Result<Option<QueryResult>>;

    /// Called with the result (from the server or a `pre_process` hook).
    /// Returning a result replaces it for the caller and later interceptors.
    fn post_process(&mut self, sql: &str, result: &QueryResult) -> Result<Option<QueryResult>> {
        let _ = (sql, result);
        Ok(None)
    }
}

/// Interceptors invoked in registration order.
#[derive(Default)]
pub struct InterceptorChain {
    interceptors: Vec<Box<dyn QueryInterceptor>>,
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interceptor: Box<dyn QueryInterceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run every `pre_process` hook; the last one that produced a result wins.
    pub fn pre_process(&mut self, sql: &str) -> Result<Option<QueryResult>> {
        let mut replacement = None;
        for interceptor in &mut self.interceptors {
            if let Some(result) = interceptor.pre_process(sql)? {
                replacement = Some(result);
            }
        }
        Ok(replacement)
    }

    /// Run every `post_process` hook, threading replacements through.
    pub fn post_process(&mut self, sql: &str, mut result: QueryResult) -> Result<QueryResult> {
        for interceptor in &mut self.interceptors {
            if let Some(replaced) = interceptor.post_process(sql, &result)? {
                result = replaced;
            }
        }
        Ok(result)
    }

    /// Wrap `execute` with the chain.
    pub fn run<F>(&mut self, sql: &str, execute: F) -> Result<QueryResult>
    where
        F: FnOnce(&str) -> Result<QueryResult>,
    {
        let result = match self.pre_process(sql)? {
            Some(result) => {
                tracing::debug!(sql, "query answered by interceptor");
                result
            }
            None => execute(sql)?,
        };
        self.post_process(sql, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        answer: Option<u64>,
    }

    impl QueryInterceptor for Recorder {
        fn pre_process(&mut self, sql: &str) -> Result<Option<QueryResult>> {
            self.log.lock().push(format!("pre {} {sql}", self.name));
            Ok(self.answer.map(|n| QueryResult {
                affected_rows: n,
                ..QueryResult::default()
            }))
        }

        fn post_process(&mut self, _sql: &str, result: &QueryResult) -> Result<Option<QueryResult>> {
            self.log
                .lock()
                .push(format!("post {} {}", self.name, result.affected_rows));
            Ok(None)
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>, answer: Option<u64>) -> Box<Recorder> {
        Box::new(Recorder {
            name,
            log: Arc::clone(log),
            answer,
        })
    }

    #[test]
    fn test_chain_runs_in_order_and_executes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = InterceptorChain::new();
        chain.push(recorder("a", &log, None));
        chain.push(recorder("b", &log, None));
        let result = chain
            .run("SELECT 1", |_| {
                Ok(QueryResult {
                    affected_rows: 3,
                    ..QueryResult::default()
                })
            })
            .unwrap();
        assert_eq!(result.affected_rows, 3);
        assert_eq!(
            *log.lock(),
            vec!["pre a SELECT 1", "pre b SELECT 1", "post a 3", "post b 3"]
        );
    }

    #[test]
    fn test_last_pre_process_result_wins_and_skips_execution() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = InterceptorChain::new();
        chain.push(recorder("a", &log, Some(1)));
        chain.push(recorder("b", &log, Some(2)));
        chain.push(recorder("c", &log, None));
        let result = chain
            .run("DO 1", |_| panic!("must not execute"))
            .unwrap();
        assert_eq!(result.affected_rows, 2);
    }

    struct Rewriter;

    impl QueryInterceptor for Rewriter {
        fn pre_process(&mut self, _sql: &str) -> Result<Option<QueryResult>> {
            Ok(None)
        }

        fn post_process(&mut self, _sql: &str, result: &QueryResult) -> Result<Option<QueryResult>> {
            Ok(Some(QueryResult {
                affected_rows: result.affected_rows * 10,
                ..result.clone()
            }))
        }
    }

    #[test]
    fn test_post_process_replacement_is_threaded() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = InterceptorChain::new();
        chain.push(Box::new(Rewriter));
        chain.push(recorder("after", &log, None));
        let result = chain
            .run("UPDATE t SET a = 1", |_| {
                Ok(QueryResult {
                    affected_rows: 4,
                    ..QueryResult::default()
                })
            })
            .unwrap();
        assert_eq!(result.affected_rows, 40);
        assert_eq!(log.lock().last().map(String::as_str), Some("post after 40"));
    }
}
