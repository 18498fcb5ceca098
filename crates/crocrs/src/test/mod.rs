// In-crate test suite. `support` carries the bytecode builder the tests
// use in place of a compiler front-end.

mod support;

mod test_calls;
mod test_coroutine;
mod test_laws;
mod test_loops;
mod test_values;
mod test_varargs;
