mod support;

mod credentials;
