mod connection_test;
mod consumer_test;
mod rpc_test;
