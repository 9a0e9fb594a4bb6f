mod state_test;
