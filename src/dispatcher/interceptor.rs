//! Dispatcher decorators.

use std::rc::Rc;

use crate::dispatcher::Dispatcher;

/// Wraps a dispatcher in another one that adds a policy.
pub type Interceptor = Box<dyn FnOnce(Rc<dyn Dispatcher>) -> Rc<dyn Dispatcher>>;

/// Nest `interceptors` around `dispatcher`. The first interceptor is the
/// outermost: it sees each request before the others do.
pub fn compose(dispatcher: Rc<dyn Dispatcher>, interceptors: Vec<Interceptor>) -> Rc<dyn Dispatcher> {
    interceptors
        .into_iter()
        .rev()
        .fold(dispatcher, |next, interceptor| interceptor(next))
}
